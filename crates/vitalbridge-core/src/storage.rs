//! Persistent storage for calibration ledgers.
//!
//! Uses one JSON file per device under `calibration/`. File names are the
//! hex-encoded device id, so distinct ids never share a file; the id itself
//! is stored inside the file.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calibration::CalibrationRecord;

/// Errors raised by the ledger store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A ledger file could not be read.
    #[error("Failed to read {}: {source}", .path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A ledger file could not be written.
    #[error("Failed to write {}: {source}", .path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A ledger file holds invalid JSON.
    #[error("Failed to parse {}: {source}", .path.display())]
    ParseError {
        /// File path.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A ledger could not be serialized.
    #[error("Failed to serialize ledger: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// The ledger directory could not be created.
    #[error("Failed to create directory {}: {source}", .path.display())]
    CreateDirError {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No platform data directory could be determined.
    #[error("Cannot determine the platform data directory")]
    NoDataDirectory,
}

/// On-disk shape of one device's ledger.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    device_id: String,
    records: Vec<CalibrationRecord>,
}

/// JSON-file storage for calibration ledgers.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    data_dir: PathBuf,
}

impl LedgerStore {
    /// Create a store rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// A store at the default data location.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NoDataDirectory`] if no platform directory is known.
    pub fn default_location() -> Result<Self, StorageError> {
        default_data_dir().map(Self::new)
    }

    /// Root data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn ledger_dir(&self) -> PathBuf {
        self.data_dir.join("calibration")
    }

    fn ledger_path(&self, device_id: &str) -> PathBuf {
        let file_name = device_id
            .bytes()
            .fold(String::with_capacity(device_id.len() * 2), |mut name, b| {
                let _ = write!(name, "{b:02x}");
                name
            });
        self.ledger_dir().join(format!("{file_name}.json"))
    }

    /// Load one device's ledger. A missing file is an empty ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_ledger(&self, device_id: &str) -> Result<Vec<CalibrationRecord>, StorageError> {
        let path = self.ledger_path(device_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(read_ledger_file(&path)?.records)
    }

    /// Replace one device's ledger on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save_ledger(
        &self,
        device_id: &str,
        records: &[CalibrationRecord],
    ) -> Result<(), StorageError> {
        let dir = self.ledger_dir();
        std::fs::create_dir_all(&dir).map_err(|source| StorageError::CreateDirError {
            path: dir.clone(),
            source,
        })?;

        let path = self.ledger_path(device_id);
        let content = serde_json::to_string_pretty(&LedgerFile {
            device_id: device_id.to_string(),
            records: records.to_vec(),
        })?;

        // Write then rename so a crash never leaves a truncated ledger.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|source| StorageError::WriteError {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StorageError::WriteError {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(device_id, records = records.len(), path = %path.display(), "Ledger saved");
        Ok(())
    }

    /// Load every ledger in the store, keyed by device id.
    ///
    /// # Errors
    ///
    /// Returns an error if any ledger file cannot be read or parsed.
    pub fn load_all(&self) -> Result<HashMap<String, Vec<CalibrationRecord>>, StorageError> {
        let dir = self.ledger_dir();
        let mut ledgers = HashMap::new();
        if !dir.exists() {
            return Ok(ledgers);
        }

        let entries = std::fs::read_dir(&dir).map_err(|source| StorageError::ReadError {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::ReadError {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file = read_ledger_file(&path)?;
            ledgers.insert(file.device_id, file.records);
        }
        Ok(ledgers)
    }
}

fn read_ledger_file(path: &Path) -> Result<LedgerFile, StorageError> {
    let content = std::fs::read_to_string(path).map_err(|source| StorageError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| StorageError::ParseError {
        path: path.to_path_buf(),
        source,
    })
}

/// Default data directory.
///
/// On Linux: `/var/lib/vitalbridge/`
/// Elsewhere: the platform data directory.
///
/// # Errors
///
/// Returns [`StorageError::NoDataDirectory`] if no home directory is known.
pub fn default_data_dir() -> Result<PathBuf, StorageError> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/var/lib/vitalbridge"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let dirs = directories::ProjectDirs::from("", "", "vitalbridge")
            .ok_or(StorageError::NoDataDirectory)?;
        Ok(dirs.data_dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::calibration::{CalibrationStatus, CalibrationType};

    fn record(device_id: &str) -> CalibrationRecord {
        CalibrationRecord {
            calibration_id: Uuid::now_v7(),
            device_id: device_id.to_string(),
            calibration_date: Utc::now(),
            calibration_type: CalibrationType::User,
            reference_values: BTreeMap::from([("temperature".to_string(), 37.0)]),
            measured_values: BTreeMap::from([("temperature".to_string(), 37.05)]),
            deviation_values: BTreeMap::from([("temperature".to_string(), 0.05)]),
            status: CalibrationStatus::Calibrated,
            next_calibration_due: None,
            samples_taken: 1,
            samples_used: 1,
            technician_id: Some("tech-7".into()),
            notes: None,
        }
    }

    #[test]
    fn test_missing_ledger_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path());
        assert!(store.load_ledger("nobody").unwrap().is_empty());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path());
        let records = vec![record("thermo-1"), record("thermo-1")];

        store.save_ledger("thermo-1", &records).unwrap();
        assert_eq!(store.load_ledger("thermo-1").unwrap(), records);
        assert!(store.ledger_path("thermo-1").exists());
        assert!(!store.ledger_path("thermo-1").with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_all_keeps_original_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path());
        store.save_ledger("bp/1", &[record("bp/1")]).unwrap();
        store.save_ledger("plx-2", &[record("plx-2")]).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["bp/1"].len(), 1);
        assert!(dir.path().join("calibration").join("62702f31.json").exists());
    }

    #[test]
    fn test_similar_ids_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path());
        store.save_ledger("a.b", &[record("a.b")]).unwrap();
        store.save_ledger("a_b", &[record("a_b"), record("a_b")]).unwrap();

        assert_ne!(store.ledger_path("a.b"), store.ledger_path("a_b"));
        assert_eq!(store.load_ledger("a.b").unwrap().len(), 1);
        assert_eq!(store.load_ledger("a_b").unwrap().len(), 2);

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a.b"][0].device_id, "a.b");
    }

    #[test]
    fn test_corrupt_ledger_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("calibration")).unwrap();
        std::fs::write(store.ledger_path("bad"), "{not json").unwrap();

        assert!(matches!(
            store.load_ledger("bad"),
            Err(StorageError::ParseError { .. })
        ));
        assert!(store.load_all().is_err());
    }
}
