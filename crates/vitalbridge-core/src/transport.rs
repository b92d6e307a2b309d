//! Bluetooth transport seam.
//!
//! The integration layer never drives a radio directly. Everything it needs
//! from the link layer goes through [`Transport`]: scanning, connecting,
//! subscribing to characteristic notifications, and tearing the link down.
//!
//! Two implementations ship with the crate:
//!
//! - [`SimulatedTransport`] - in-memory peripherals, always compiled. Used by
//!   tests and the daemon's demo mode.
//! - `BluezTransport` - BlueZ over D-Bus via `bluer`, behind the `bluetooth`
//!   feature.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "bluetooth")]
mod bluez;
mod simulated;

#[cfg(feature = "bluetooth")]
pub use bluez::BluezTransport;
pub use simulated::{payloads, SimulatedPeripheral, SimulatedTransport};

/// Callback invoked with each raw notification payload.
///
/// Handlers run on the transport's delivery task and must not block.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Errors raised by a transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// No Bluetooth adapter is present.
    #[error("No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded.")]
    AdapterNotFound,

    /// The adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    AdapterPoweredOff,

    /// Device discovery failed.
    #[error("Bluetooth scan failed: {message}")]
    ScanFailed {
        /// Underlying failure.
        message: String,
    },

    /// The link could not be established.
    #[error("Failed to connect to {address}: {message}")]
    ConnectFailed {
        /// Peripheral address.
        address: String,
        /// Underlying failure.
        message: String,
    },

    /// Enabling notifications on a characteristic failed.
    #[error("Failed to subscribe to {characteristic} on {address}: {message}")]
    SubscribeFailed {
        /// Peripheral address.
        address: String,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Underlying failure.
        message: String,
    },

    /// Tearing down the link failed.
    #[error("Failed to disconnect from {address}: {message}")]
    DisconnectFailed {
        /// Peripheral address.
        address: String,
        /// Underlying failure.
        message: String,
    },

    /// A characteristic read or write failed.
    #[error("GATT operation on {address} failed: {message}")]
    GattFailed {
        /// Peripheral address.
        address: String,
        /// Underlying failure.
        message: String,
    },

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {secs} seconds")]
    Timeout {
        /// What was being attempted.
        operation: String,
        /// Deadline in seconds.
        secs: u64,
    },

    /// The operation needs a live link to the peripheral.
    #[error("Not connected to {address}")]
    NotConnected {
        /// Peripheral address.
        address: String,
    },
}

/// One device sighting during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Transport address (MAC on Linux).
    pub address: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised GATT service UUIDs.
    pub service_uuids: Vec<Uuid>,
}

/// Raw link-layer primitives the integration layer is built on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Scan for advertising peripherals for `duration`.
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>, TransportError>;

    /// Establish a link to `address`.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Enable notifications on `characteristic`, delivering payloads to `handler`.
    async fn subscribe(
        &self,
        address: &str,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError>;

    /// Disable notifications on `characteristic`. Unknown subscriptions are ignored.
    async fn unsubscribe(&self, address: &str, characteristic: Uuid) -> Result<(), TransportError>;

    /// Tear down the link. Disconnecting an unknown peripheral succeeds.
    async fn disconnect(&self, address: &str) -> Result<(), TransportError>;

    /// Ask the peripheral to start a measurement cycle.
    ///
    /// Most SIG devices measure on their own button press and simply notify,
    /// so the default does nothing.
    async fn trigger_measurement(
        &self,
        _address: &str,
        _characteristic: Uuid,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    /// Read the standard Battery Level characteristic, if the device has one.
    async fn read_battery_level(&self, _address: &str) -> Result<Option<u8>, TransportError> {
        Ok(None)
    }
}
