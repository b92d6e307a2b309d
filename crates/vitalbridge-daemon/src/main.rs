//! # vitalbridge-daemon
//!
//! Kiosk process for the vitalbridge medical device integration layer.
//!
//! This binary:
//! - Loads `KioskConfig` from `VITALBRIDGE_CONFIG` or the platform default path
//! - Discovers and connects the kiosk's vital-sign devices
//! - Delivers decoded readings to the structured log
//! - Monitors device health and logs a periodic report
//!
//! ## Running
//!
//! ```bash
//! # Development (simulated devices)
//! cargo run --package vitalbridge-daemon
//!
//! # Production (on the kiosk)
//! ./vitalbridge-daemon
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vitalbridge_core::{default_config_path, DeviceService, KioskConfig};
use vitalbridge_daemon::sink::TracingSink;
use vitalbridge_daemon::{logging, simulation, transport};

/// Overrides the configuration file location.
const CONFIG_PATH_ENV: &str = "VITALBRIDGE_CONFIG";

/// How often the demo devices produce a measurement round.
const SIMULATION_PERIOD: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) => PathBuf::from(path),
        None => default_config_path()?,
    };
    let config = KioskConfig::load_or_default(&config_path)?;

    logging::init(&config.logging)?;
    info!(config = %config_path.display(), "Starting vitalbridge-daemon");

    if !config_path.exists() {
        match config.save(&config_path) {
            Ok(()) => info!(path = %config_path.display(), "Wrote default configuration"),
            Err(e) => warn!(path = %config_path.display(), error = %e, "Could not write default configuration"),
        }
    }

    let selected = transport::select(&config.daemon).await?;
    let sink = Arc::new(TracingSink::new());
    let service = DeviceService::new(&config, selected.as_transport(), sink.clone())?;

    let shutdown = CancellationToken::new();
    let emitter = selected.simulated().map(|simulated| {
        simulation::spawn_emitter(simulated.clone(), SIMULATION_PERIOD, shutdown.clone())
    });

    service.start_health_monitoring();
    connect_devices(&service, &config).await;

    let mut report_ticker = tokio::time::interval(config.daemon.report_interval());
    report_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    report_ticker.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
            _ = report_ticker.tick() => {
                let report = service.get_health_report().await;
                info!(
                    total = report.summary.total_devices,
                    healthy = report.summary.healthy,
                    warning = report.summary.warning,
                    critical = report.summary.critical,
                    offline = report.summary.offline,
                    readings = sink.stored(),
                    "Health report"
                );
            }
        }
    }

    info!("Shutdown requested");
    shutdown.cancel();
    if let Some(emitter) = emitter {
        if let Err(e) = emitter.await {
            warn!(error = %e, "Simulation emitter ended abnormally");
        }
    }
    service.shutdown().await;
    info!("vitalbridge-daemon stopped");

    Ok(())
}

/// Run one discovery pass and, if configured, connect every device found.
///
/// Failures are logged; the daemon keeps running with whatever connected.
async fn connect_devices(service: &DeviceService, config: &KioskConfig) {
    let found = match service.discover(config.devices.scan_duration()).await {
        Ok(found) => found,
        Err(e) => {
            warn!(error = %e, code = e.error_code(), "Initial discovery failed");
            return;
        }
    };
    info!(devices = found.len(), "Initial discovery finished");

    if !config.daemon.auto_connect {
        return;
    }
    for device in found {
        let device_id = device.device_id.clone();
        if let Err(e) = service.connect(device).await {
            warn!(%device_id, error = %e, code = e.error_code(), "Auto-connect failed");
        }
    }
}
