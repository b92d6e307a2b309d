//! Generates the component schema document to a JSON file.
//!
//! Run with: cargo run --bin gen-schema -p vitalbridge-daemon
//!
//! The generated file is placed in the workspace root for collaborators that
//! generate client types from it.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;

fn main() -> anyhow::Result<()> {
    println!("Generating schema document...\n");

    let json = vitalbridge_daemon::schema::schema_json()?;

    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let workspace_root = manifest_dir
        .parent()
        .and_then(|p| p.parent())
        .context("Could not find workspace root")?;

    let output_path = workspace_root.join("schema.json");
    fs::write(&output_path, &json)
        .with_context(|| format!("Failed to write to {}", output_path.display()))?;

    println!("Written to: {}", output_path.display());

    if let Ok(document) = serde_json::from_str::<serde_json::Value>(&json) {
        if let Some(schemas) = document
            .get("components")
            .and_then(|c| c.get("schemas"))
            .and_then(|s| s.as_object())
        {
            println!("Schemas: {}", schemas.len());
        }
    }

    println!("\nSchema document generated successfully!");
    Ok(())
}
