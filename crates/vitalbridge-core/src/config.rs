//! Kiosk configuration management.
//!
//! Handles loading, saving, and validating the integration layer's settings:
//! - Device discovery and connection timing
//! - Name patterns used to identify medical devices
//! - Health monitoring cadence and retention
//! - Calibration ledger persistence
//! - Logging and daemon behavior
//!
//! Configuration is read from an optional TOML file, then overridden by
//! `VITALBRIDGE__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DeviceType;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "VITALBRIDGE";

/// Allowed range for the discovery scan duration, in seconds.
pub const SCAN_DURATION_RANGE: std::ops::RangeInclusive<u64> = 5..=60;

static MAC_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("MAC address pattern is valid")
});

/// Whether `address` is a colon-separated 48-bit MAC address.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS.is_match(address)
}

/// Errors raised while loading, saving, or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// The configuration file could not be written.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The merged sources could not be parsed into a configuration.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// The configuration could not be serialized to TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field holds an invalid value.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("Configuration has {} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),

    /// No platform directory could be determined for the default path.
    #[error("Cannot determine the platform {0} directory")]
    NoPlatformDirectory(&'static str),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KioskConfig {
    /// Discovery and connection settings.
    pub devices: DevicesConfig,
    /// Health monitoring settings.
    pub health: HealthConfig,
    /// Calibration ledger settings.
    pub calibration: CalibrationConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Daemon process settings.
    pub daemon: DaemonConfig,
}

/// Maps a case-insensitive substring of an advertised name to a device class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamePattern {
    /// Lowercase substring to look for.
    pub pattern: String,
    /// Device class it identifies.
    pub device_type: DeviceType,
}

impl NamePattern {
    fn new(pattern: &str, device_type: DeviceType) -> Self {
        Self {
            pattern: pattern.to_string(),
            device_type,
        }
    }

    /// Whether `name` contains this pattern, ignoring case.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        name.to_lowercase().contains(&self.pattern.to_lowercase())
    }

    /// Manufacturer name derived from the pattern, e.g. `omron` -> `Omron`.
    #[must_use]
    pub fn manufacturer(&self) -> String {
        let mut chars = self.pattern.chars();
        chars.next().map_or_else(String::new, |first| {
            first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
        })
    }
}

/// Discovery and connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// How long a discovery scan runs.
    pub scan_duration_secs: u64,
    /// Upper bound on establishing a link.
    pub connect_timeout_secs: u64,
    /// Upper bound on a battery level read.
    pub battery_timeout_secs: u64,
    /// Name patterns checked in order before falling back to service UUIDs.
    pub name_patterns: Vec<NamePattern>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            scan_duration_secs: 10,
            connect_timeout_secs: 10,
            battery_timeout_secs: 5,
            name_patterns: vec![
                NamePattern::new("omron", DeviceType::BloodPressure),
                NamePattern::new("nonin", DeviceType::PulseOximeter),
                NamePattern::new("braun", DeviceType::Thermometer),
                NamePattern::new("withings", DeviceType::WeightScale),
            ],
        }
    }
}

impl DevicesConfig {
    /// Scan duration.
    #[must_use]
    pub const fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Battery read timeout.
    #[must_use]
    pub const fn battery_timeout(&self) -> Duration {
        Duration::from_secs(self.battery_timeout_secs)
    }
}

/// Health monitoring settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between polls.
    pub interval_secs: u64,
    /// Hours of samples kept per device.
    pub retention_hours: u32,
    /// Samples per device included in a health report.
    pub report_sample_count: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            retention_hours: 24,
            report_sample_count: 10,
        }
    }
}

impl HealthConfig {
    /// Poll interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Retention window.
    #[must_use]
    pub fn retention(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::hours(i64::from(self.retention_hours))
    }
}

/// Calibration ledger settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Write ledgers to disk after every append.
    pub persist_ledger: bool,
    /// Ledger directory. Defaults to the platform data directory.
    pub ledger_dir: Option<PathBuf>,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// JSON file output instead of pretty console output.
    pub production: bool,
    /// Directory for rolling log files in production.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            production: false,
            log_dir: None,
        }
    }
}

/// Daemon process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Use simulated peripherals instead of the Bluetooth stack.
    pub simulate: bool,
    /// Connect to every identified device after discovery.
    pub auto_connect: bool,
    /// Seconds between logged health reports.
    pub report_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            simulate: !cfg!(feature = "bluetooth"),
            auto_connect: true,
            report_interval_secs: 300,
        }
    }
}

impl DaemonConfig {
    /// Interval between logged health reports.
    #[must_use]
    pub const fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl KioskConfig {
    /// Load configuration from `path` (if present) and the environment.
    ///
    /// A missing file yields the defaults, still subject to environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the sources cannot be parsed or the result fails
    /// validation.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = settings.try_deserialize()?;
        loaded.validate()?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(loaded)
    }

    /// Load configuration from `path`, which must exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file is missing, otherwise as
    /// [`load_or_default`](Self::load_or_default).
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::load_or_default(path)
    }

    /// Write the configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        })
    }

    /// Check every field, reporting all violations at once.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigError::ValidationError`], or
    /// [`ConfigError::MultipleValidationErrors`] when several fields are bad.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: String| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message,
            });
        };

        if !SCAN_DURATION_RANGE.contains(&self.devices.scan_duration_secs) {
            invalid(
                "devices.scan_duration_secs",
                format!(
                    "must be between {} and {} seconds (got {})",
                    SCAN_DURATION_RANGE.start(),
                    SCAN_DURATION_RANGE.end(),
                    self.devices.scan_duration_secs
                ),
            );
        }
        if self.devices.connect_timeout_secs == 0 {
            invalid("devices.connect_timeout_secs", "must be positive".into());
        }
        if self.devices.battery_timeout_secs == 0 {
            invalid("devices.battery_timeout_secs", "must be positive".into());
        }
        for (i, p) in self.devices.name_patterns.iter().enumerate() {
            if p.pattern.trim().is_empty() {
                invalid(&format!("devices.name_patterns[{i}].pattern"), "cannot be empty".into());
            }
        }
        if self.health.interval_secs == 0 {
            invalid("health.interval_secs", "must be positive".into());
        }
        if self.health.retention_hours == 0 {
            invalid("health.retention_hours", "must be positive".into());
        }
        if self.health.report_sample_count == 0 {
            invalid("health.report_sample_count", "must be positive".into());
        }
        let level = self.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) && !level.contains('=') {
            invalid(
                "logging.level",
                format!(
                    "'{}' is not a level ({}) or a filter directive",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            );
        }
        if self.daemon.report_interval_secs == 0 {
            invalid("daemon.report_interval_secs", "must be positive".into());
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Default configuration file location.
///
/// On Linux: `/etc/vitalbridge/config.toml`
/// Elsewhere: the platform config directory.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformDirectory`] if no home directory is known.
pub fn default_config_path() -> ConfigResult<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/vitalbridge/config.toml"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let dirs = directories::ProjectDirs::from("", "", "vitalbridge")
            .ok_or(ConfigError::NoPlatformDirectory("config"))?;
        Ok(dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = KioskConfig::default();
        config.validate().unwrap();
        assert_eq!(config.devices.scan_duration(), Duration::from_secs(10));
        assert_eq!(config.health.interval(), Duration::from_secs(60));
        assert_eq!(config.health.retention(), chrono::TimeDelta::hours(24));
        assert_eq!(config.devices.name_patterns.len(), 4);
    }

    #[test]
    fn test_mac_address_validation() {
        assert!(is_valid_mac_address("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_mac_address("00:1a:7d:da:71:13"));
        assert!(!is_valid_mac_address("AA:BB:CC:DD:EE"));
        assert!(!is_valid_mac_address("AA-BB-CC-DD-EE-FF"));
        assert!(!is_valid_mac_address("GG:BB:CC:DD:EE:FF"));
        assert!(!is_valid_mac_address(""));
    }

    #[test]
    fn test_name_pattern_matching() {
        let omron = NamePattern::new("omron", DeviceType::BloodPressure);
        assert!(omron.matches("OMRON BP7250"));
        assert!(omron.matches("my Omron cuff"));
        assert!(!omron.matches("Nonin 3230"));
        assert_eq!(omron.manufacturer(), "Omron");
    }

    #[test]
    fn test_scan_duration_bounds() {
        let mut config = KioskConfig::default();
        config.devices.scan_duration_secs = 4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { ref field, .. }) if field == "devices.scan_duration_secs"
        ));
        config.devices.scan_duration_secs = 60;
        config.validate().unwrap();
        config.devices.scan_duration_secs = 61;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_collects_every_error() {
        let mut config = KioskConfig::default();
        config.health.interval_secs = 0;
        config.health.retention_hours = 0;
        config.logging.level = "loud".into();

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_filter_directive_is_accepted_as_level() {
        let mut config = KioskConfig::default();
        config.logging.level = "vitalbridge_core=debug,info".into();
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = KioskConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.health, HealthConfig::default());
        assert!(KioskConfig::load(dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_partial_file_is_merged_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[health]\ninterval_secs = 15\n\n[calibration]\npersist_ledger = true\n",
        )
        .unwrap();

        let config = KioskConfig::load(&path).unwrap();
        assert_eq!(config.health.interval_secs, 15);
        assert_eq!(config.health.retention_hours, 24);
        assert!(config.calibration.persist_ledger);
        assert_eq!(config.devices, DevicesConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = KioskConfig::default();
        config.devices.scan_duration_secs = 20;
        config
            .devices
            .name_patterns
            .push(NamePattern::new("beurer", DeviceType::Thermometer));
        config.save(&path).unwrap();

        let loaded = KioskConfig::load(&path).unwrap();
        assert_eq!(loaded.devices.scan_duration_secs, 20);
        assert_eq!(loaded.devices.name_patterns.len(), 5);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[devices]\nscan_duration_secs = 120\n").unwrap();
        assert!(matches!(
            KioskConfig::load(&path),
            Err(ConfigError::ValidationError { .. })
        ));
    }
}
