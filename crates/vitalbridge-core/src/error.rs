//! Unified error types for the vitalbridge core library.
//!
//! This module provides a unified error type [`BridgeError`] that covers all
//! failure modes across the integration layer. Each module also has its own
//! specific error type (`TransportError`, `DeviceError`, `DecodeError`,
//! `CalibrationError`, `SinkError`, `StorageError`, `ConfigError`) for
//! internal use; all of them convert into [`BridgeError`].
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide operators toward resolution
//! - **Context preservation**: Wrapped errors keep the device they concern
//! - **Collaborator-ready**: Every error has a stable machine-readable code
//!
//! # Example
//!
//! ```rust
//! use vitalbridge_core::error::{BridgeError, Result};
//!
//! fn require_device(found: bool, device_id: &str) -> Result<()> {
//!     if !found {
//!         return Err(BridgeError::DeviceNotFound(device_id.to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ConnectionState, DeviceType};

/// The unified error type for all integration layer operations.
///
/// Nothing here is process-fatal: every variant describes the failure of one
/// call against one device or resource.
#[derive(Debug, Error)]
pub enum BridgeError {
    // =========================================================================
    // TRANSPORT ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded."
    )]
    AdapterNotFound,

    /// The Bluetooth adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    AdapterPoweredOff,

    /// Device discovery failed.
    #[error("Bluetooth scan failed: {0}")]
    ScanFailed(String),

    /// A link operation on a device failed. The device is left in `error`.
    #[error("Connection to device '{device_id}' failed: {message}")]
    ConnectionFailed {
        /// Device concerned.
        device_id: String,
        /// Underlying failure.
        message: String,
    },

    /// A transport operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    // =========================================================================
    // DEVICE ERRORS
    // =========================================================================
    /// No device with this id is known.
    #[error("Device not found: '{0}'. Run discovery and ensure the device is powered on and within range.")]
    DeviceNotFound(String),

    /// The device is not connected or is busy.
    #[error("Device '{device_id}' is not ready (state: {state})")]
    DeviceNotReady {
        /// Device concerned.
        device_id: String,
        /// State at the time of the call.
        state: ConnectionState,
    },

    /// The device class is not supported for this operation.
    #[error("Device type '{0}' is not supported")]
    UnsupportedDeviceType(DeviceType),

    /// The transport address is malformed.
    #[error("Invalid device address: '{0}'. Expected format XX:XX:XX:XX:XX:XX")]
    InvalidAddress(String),

    /// A measurement payload could not be decoded.
    #[error("Failed to decode measurement: {0}")]
    DecodeFailed(String),

    // =========================================================================
    // CALIBRATION ERRORS
    // =========================================================================
    /// The device cannot be calibrated as requested.
    #[error("Device '{device_id}' cannot be calibrated: {reason}")]
    InvalidCalibrationTarget {
        /// Device concerned.
        device_id: String,
        /// Why it was refused.
        reason: String,
    },

    /// A required reference value was not supplied.
    #[error("Missing reference value for '{0}'")]
    MissingReference(String),

    /// Another calibration of the same device is running.
    #[error("Calibration already in progress for device '{0}'")]
    CalibrationInProgress(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// The reading sink refused or lost a reading.
    #[error("Reading sink error: {0}")]
    SinkError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for integration layer operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Returns `true` if this error came from the Bluetooth transport.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::AdapterNotFound
                | Self::AdapterPoweredOff
                | Self::ScanFailed(_)
                | Self::ConnectionFailed { .. }
                | Self::Timeout(_)
        )
    }

    /// Returns `true` if the requested device does not exist.
    #[inline]
    #[must_use]
    pub const fn is_lookup_error(&self) -> bool {
        matches!(self, Self::DeviceNotFound(_))
    }

    /// Returns `true` if a calibration request was refused.
    #[inline]
    #[must_use]
    pub const fn is_calibration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidCalibrationTarget { .. }
                | Self::MissingReference(_)
                | Self::CalibrationInProgress(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(
            self,
            Self::PersistenceError(_) | Self::SinkError(_) | Self::IoError(_)
        )
    }

    /// Returns `true` if retrying the same call later may succeed.
    ///
    /// The integration layer never retries on its own; this is a hint for
    /// callers.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ScanFailed(_)
                | Self::ConnectionFailed { .. }
                | Self::Timeout(_)
                | Self::DeviceNotReady { .. }
                | Self::CalibrationInProgress(_)
        )
    }

    /// Returns a machine-readable error code for collaborators.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::AdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::AdapterPoweredOff => "BLUETOOTH_ADAPTER_POWERED_OFF",
            Self::ScanFailed(_) => "BLUETOOTH_SCAN_FAILED",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::DeviceNotReady { .. } => "DEVICE_NOT_READY",
            Self::UnsupportedDeviceType(_) => "UNSUPPORTED_DEVICE_TYPE",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::DecodeFailed(_) => "DECODE_FAILED",
            Self::InvalidCalibrationTarget { .. } => "INVALID_CALIBRATION_TARGET",
            Self::MissingReference(_) => "MISSING_REFERENCE",
            Self::CalibrationInProgress(_) => "CALIBRATION_IN_PROGRESS",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::SinkError(_) => "SINK_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::transport::TransportError> for BridgeError {
    fn from(err: crate::transport::TransportError) -> Self {
        use crate::transport::TransportError;
        match err {
            TransportError::AdapterNotFound => Self::AdapterNotFound,
            TransportError::AdapterPoweredOff => Self::AdapterPoweredOff,
            TransportError::ScanFailed { message } => Self::ScanFailed(message),
            TransportError::Timeout { .. } => Self::Timeout(err.to_string()),
            TransportError::ConnectFailed { ref address, .. }
            | TransportError::SubscribeFailed { ref address, .. }
            | TransportError::DisconnectFailed { ref address, .. }
            | TransportError::GattFailed { ref address, .. }
            | TransportError::NotConnected { ref address } => Self::ConnectionFailed {
                device_id: address.clone(),
                message: err.to_string(),
            },
        }
    }
}

impl From<crate::driver::DeviceError> for BridgeError {
    fn from(err: crate::driver::DeviceError) -> Self {
        use crate::driver::DeviceError;
        use crate::transport::TransportError;
        match err {
            DeviceError::NotFound { device_id } => Self::DeviceNotFound(device_id),
            DeviceError::NotReady { device_id, state } => Self::DeviceNotReady { device_id, state },
            DeviceError::UnsupportedDeviceType { device_type } => {
                Self::UnsupportedDeviceType(device_type)
            }
            DeviceError::InvalidAddress { address } => Self::InvalidAddress(address),
            DeviceError::Discovery { source } => source.into(),
            DeviceError::Transport { device_id, source } => match source {
                TransportError::AdapterNotFound => Self::AdapterNotFound,
                TransportError::AdapterPoweredOff => Self::AdapterPoweredOff,
                TransportError::Timeout { .. } => Self::Timeout(source.to_string()),
                other => Self::ConnectionFailed {
                    device_id,
                    message: other.to_string(),
                },
            },
        }
    }
}

impl From<crate::codec::DecodeError> for BridgeError {
    fn from(err: crate::codec::DecodeError) -> Self {
        use crate::codec::DecodeError;
        match err {
            DecodeError::UnsupportedDeviceType(device_type) => {
                Self::UnsupportedDeviceType(device_type)
            }
            other => Self::DecodeFailed(other.to_string()),
        }
    }
}

impl From<crate::calibration::CalibrationError> for BridgeError {
    fn from(err: crate::calibration::CalibrationError) -> Self {
        use crate::calibration::CalibrationError;
        match err {
            CalibrationError::DeviceNotFound { device_id } => Self::DeviceNotFound(device_id),
            CalibrationError::InvalidDevice { device_id, reason } => {
                Self::InvalidCalibrationTarget { device_id, reason }
            }
            CalibrationError::NoProcedure { device_type } => {
                Self::UnsupportedDeviceType(device_type)
            }
            CalibrationError::MissingReference { field } => Self::MissingReference(field),
            CalibrationError::AlreadyInProgress { device_id } => {
                Self::CalibrationInProgress(device_id)
            }
            CalibrationError::Storage(e) => e.into(),
        }
    }
}

impl From<crate::sink::SinkError> for BridgeError {
    fn from(err: crate::sink::SinkError) -> Self {
        Self::SinkError(err.to_string())
    }
}

impl From<crate::storage::StorageError> for BridgeError {
    fn from(err: crate::storage::StorageError) -> Self {
        use crate::storage::StorageError;
        match err {
            StorageError::ParseError { path, source } => {
                Self::PersistenceError(format!("Corrupt ledger {}: {source}", path.display()))
            }
            other => Self::PersistenceError(other.to_string()),
        }
    }
}

impl From<crate::config::ConfigError> for BridgeError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path.into()),
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {path}: {source}"))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
            ConfigError::NoPlatformDirectory(kind) => {
                Self::PersistenceError(format!("Cannot determine the platform {kind} directory"))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
