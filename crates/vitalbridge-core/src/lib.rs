//! # vitalbridge-core
//!
//! Medical device integration layer for the triage kiosk.
//!
//! This crate provides:
//! - Decoding of Bluetooth LE vital-sign measurements (blood pressure, pulse
//!   oximetry, body temperature)
//! - Device discovery, identification and connection lifecycle management
//! - Multi-sample calibration against reference values with an append-only ledger
//! - Continuous background health monitoring of connected devices
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`codec`] - Pure decoders from characteristic payloads to [`DeviceReading`]s
//! - [`driver`] - Connection lifecycle of one device
//! - [`manager`] - Discovery directory, driver table and reading fan-out
//! - [`calibration`] - Calibration procedures and ledgers
//! - [`health`] - Background health polling and reports
//! - [`service`] - Facade exposing all of the above to collaborators
//! - [`transport`] - The Bluetooth transport seam and its implementations
//! - [`sink`] - Where processed readings are delivered
//! - [`config`] - Kiosk configuration loading, saving, and validation
//! - [`storage`] - JSON-file persistence of calibration ledgers
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared data model and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod calibration;
pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod health;
pub mod manager;
pub mod profile;
pub mod service;
pub mod sink;
pub mod storage;
pub mod transport;
pub mod types;

// Re-export primary types for convenience
pub use calibration::{
    CalibrationError, CalibrationOptions, CalibrationRecord, CalibrationStatus, CalibrationType,
    Calibrator,
};
pub use codec::DecodeError;
pub use config::{
    default_config_path, is_valid_mac_address, CalibrationConfig, ConfigError, ConfigResult,
    DaemonConfig, DevicesConfig, HealthConfig, KioskConfig, LoggingConfig, NamePattern,
};
pub use driver::{DeviceDriver, DeviceError, DriverStats};
pub use error::{BridgeError, Result};
pub use health::{HealthMetrics, HealthMonitor, HealthReport, HealthStatus};
pub use manager::DeviceManager;
pub use service::{CalibrationRequest, DeviceService, DeviceStatus};
pub use sink::{ChannelSink, NullSink, ReadingSink, SinkError};
pub use storage::{default_data_dir, LedgerStore, StorageError};
#[cfg(feature = "bluetooth")]
pub use transport::BluezTransport;
pub use transport::{SimulatedPeripheral, SimulatedTransport, Transport, TransportError};
pub use types::{ConnectionState, DeviceInfo, DeviceReading, DeviceType, ReadingMetadata};
