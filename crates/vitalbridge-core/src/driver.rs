//! Per-device connection lifecycle and notification dispatch.
//!
//! A [`DeviceDriver`] owns exactly one device's link. It subscribes to the
//! device class's measurement characteristic, decodes every notification
//! with the matching codec, and hands decoded readings to registered
//! callbacks followed by in-process subscribers.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::codec;
use crate::profile::{self, DeviceProfile};
use crate::transport::{NotificationHandler, Transport, TransportError};
use crate::types::{ConnectionState, DeviceInfo, DeviceReading, DeviceType};

/// Readings buffered per in-process subscriber before it starts lagging.
const READING_CHANNEL_CAPACITY: usize = 16;

/// Errors raised by drivers and the device manager.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// No driver or discovered device has this id.
    #[error("Device not found: '{device_id}'")]
    NotFound {
        /// The requested device id.
        device_id: String,
    },

    /// The operation requires a connected, idle device.
    #[error("Device '{device_id}' is not ready (state: {state})")]
    NotReady {
        /// The device id.
        device_id: String,
        /// State at the time of the call.
        state: ConnectionState,
    },

    /// The device class has no measurement decoder.
    #[error("No driver available for device type '{device_type}'")]
    UnsupportedDeviceType {
        /// The unsupported class.
        device_type: DeviceType,
    },

    /// The transport address is malformed.
    #[error("Invalid device address: '{address}'. Expected format XX:XX:XX:XX:XX:XX")]
    InvalidAddress {
        /// The rejected address.
        address: String,
    },

    /// A discovery scan failed.
    #[error("Device discovery failed: {source}")]
    Discovery {
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },

    /// The transport reported a failure. The driver is left in `error`.
    #[error("Transport failure on device '{device_id}': {source}")]
    Transport {
        /// The device id.
        device_id: String,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
}

/// Callback invoked synchronously for every decoded reading.
pub type ReadingCallback = Box<dyn Fn(&DeviceReading) + Send + Sync>;

/// Running counters kept by each driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DriverStats {
    /// Notifications decoded into readings.
    pub readings_decoded: u64,
    /// Notifications that failed to decode.
    pub decode_errors: u64,
    /// Most recent transport or decode failure.
    pub last_error: Option<String>,
    /// When the current link came up.
    pub connected_since: Option<DateTime<Utc>>,
    /// When the last reading was decoded.
    pub last_reading_at: Option<DateTime<Utc>>,
}

/// Driver for one connected device.
pub struct DeviceDriver {
    info: DeviceInfo,
    profile: &'static DeviceProfile,
    measurement: Uuid,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    callbacks: RwLock<Vec<ReadingCallback>>,
    readings: broadcast::Sender<DeviceReading>,
    stats: Mutex<DriverStats>,
    connect_timeout: Duration,
    /// Serializes link setup and teardown.
    link: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for DeviceDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDriver")
            .field("device_id", &self.info.device_id)
            .field("device_type", &self.info.device_type)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DeviceDriver {
    /// Build a driver for `info`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::UnsupportedDeviceType`] when the device class has
    /// no codec or no measurement characteristic.
    pub fn new(
        info: DeviceInfo,
        transport: Arc<dyn Transport>,
        connect_timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let profile = profile::profile(info.device_type);
        let measurement = profile
            .measurement
            .filter(|_| codec::supports(info.device_type))
            .ok_or(DeviceError::UnsupportedDeviceType {
                device_type: info.device_type,
            })?;
        let (readings, _) = broadcast::channel(READING_CHANNEL_CAPACITY);

        Ok(Self {
            info,
            profile,
            measurement,
            transport,
            state: RwLock::new(ConnectionState::Disconnected),
            callbacks: RwLock::new(Vec::new()),
            readings,
            stats: Mutex::new(DriverStats::default()),
            connect_timeout,
            link: tokio::sync::Mutex::new(()),
        })
    }

    /// Device metadata captured at construction.
    #[must_use]
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Device id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.info.device_id
    }

    /// Device class.
    #[must_use]
    pub const fn device_type(&self) -> DeviceType {
        self.info.device_type
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the running counters.
    #[must_use]
    pub fn stats(&self) -> DriverStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register a callback for decoded readings. Callbacks run in registration order.
    pub fn add_callback(&self, callback: ReadingCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Subscribe to decoded readings from this point on.
    #[must_use]
    pub fn subscribe_readings(&self) -> broadcast::Receiver<DeviceReading> {
        self.readings.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            tracing::debug!(device_id = %self.info.device_id, from = %*current, to = %state, "State change");
            *current = state;
        }
    }

    /// Move `from -> to` atomically, or report the device as not ready.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<(), DeviceError> {
        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *current != from {
            return Err(DeviceError::NotReady {
                device_id: self.info.device_id.clone(),
                state: *current,
            });
        }
        *current = to;
        Ok(())
    }

    fn fail(&self, source: TransportError) -> DeviceError {
        self.set_state(ConnectionState::Error);
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error = Some(source.to_string());
        tracing::error!(
            device_id = %self.info.device_id,
            address = %self.info.mac_address,
            error = %source,
            "Transport failure"
        );
        DeviceError::Transport {
            device_id: self.info.device_id.clone(),
            source,
        }
    }

    /// Claim the driver for a connect attempt: `disconnected`/`error -> connecting`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotReady`] when a connect is already under way
    /// or the link is up.
    pub(crate) fn begin_connect(&self) -> Result<(), DeviceError> {
        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match *current {
            ConnectionState::Disconnected | ConnectionState::Error => {
                tracing::debug!(device_id = %self.info.device_id, from = %*current, "State change to connecting");
                *current = ConnectionState::Connecting;
                Ok(())
            }
            state => Err(DeviceError::NotReady {
                device_id: self.info.device_id.clone(),
                state,
            }),
        }
    }

    /// Connect and subscribe to the measurement characteristic.
    ///
    /// The link attempt is bounded by the connect timeout. On failure the
    /// driver is left in [`ConnectionState::Error`]; there is no retry.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotReady`] when the driver is not disconnected
    /// or in error, and [`DeviceError::Transport`] when the link or
    /// subscription fails.
    pub async fn connect(self: &Arc<Self>) -> Result<(), DeviceError> {
        self.begin_connect()?;
        self.establish().await
    }

    /// Bring the link up for a driver already claimed by [`begin_connect`](Self::begin_connect).
    ///
    /// Runs under the link lock, so a concurrent [`disconnect`](Self::disconnect)
    /// either cancels the attempt before it starts or waits for it and then
    /// tears the link down.
    pub(crate) async fn establish(self: &Arc<Self>) -> Result<(), DeviceError> {
        let _link = self.link.lock().await;
        let state = self.state();
        if state != ConnectionState::Connecting {
            tracing::debug!(device_id = %self.info.device_id, %state, "Connect abandoned");
            return Err(DeviceError::NotReady {
                device_id: self.info.device_id.clone(),
                state,
            });
        }
        let address = self.info.mac_address.as_str();

        let linked = match tokio::time::timeout(self.connect_timeout, self.transport.connect(address)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                operation: format!("connect to {address}"),
                secs: self.connect_timeout.as_secs(),
            }),
        };
        if let Err(e) = linked {
            return Err(self.fail(e));
        }

        let weak = Arc::downgrade(self);
        let handler: NotificationHandler = Arc::new(move |payload: &[u8]| {
            if let Some(driver) = weak.upgrade() {
                driver.on_notification(payload);
            }
        });
        if let Err(e) = self
            .transport
            .subscribe(address, self.measurement, handler)
            .await
        {
            let _ = self.transport.disconnect(address).await;
            return Err(self.fail(e));
        }

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connected_since = Some(Utc::now());
        self.transition(ConnectionState::Connecting, ConnectionState::Connected)?;
        tracing::info!(
            device_id = %self.info.device_id,
            device_type = %self.info.device_type,
            address,
            "Device connected"
        );
        Ok(())
    }

    /// Unsubscribe and drop the link. A no-op when already disconnected.
    ///
    /// Waits for an in-flight connect to finish before tearing down. A driver
    /// claimed for connecting whose link attempt has not started yet is
    /// simply released.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Transport`] when the transport fails; the driver
    /// is left in [`ConnectionState::Error`].
    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        let _link = self.link.lock().await;
        match self.state() {
            ConnectionState::Disconnected => return Ok(()),
            ConnectionState::Connecting => {
                self.set_state(ConnectionState::Disconnected);
                tracing::info!(device_id = %self.info.device_id, "Pending connect cancelled");
                return Ok(());
            }
            _ => {}
        }
        let address = self.info.mac_address.as_str();

        let result = match self.transport.unsubscribe(address, self.measurement).await {
            Ok(()) => self.transport.disconnect(address).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            return Err(self.fail(e));
        }

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connected_since = None;
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(device_id = %self.info.device_id, address, "Device disconnected");
        Ok(())
    }

    /// Decode one raw notification and dispatch the reading.
    ///
    /// Decode failures are logged and counted; the connection state is not
    /// touched.
    pub fn on_notification(&self, payload: &[u8]) {
        let reading = match codec::decode(
            self.info.device_type,
            &self.info.device_id,
            payload,
            Utc::now(),
        ) {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!(
                    device_id = %self.info.device_id,
                    device_type = %self.info.device_type,
                    error = %e,
                    len = payload.len(),
                    "Dropping undecodable notification"
                );
                let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
                stats.decode_errors += 1;
                stats.last_error = Some(e.to_string());
                return;
            }
        };

        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.readings_decoded += 1;
            stats.last_reading_at = Some(reading.metadata.received_at);
        }
        tracing::debug!(
            device_id = %reading.device_id,
            quality = reading.quality_score,
            values = ?reading.values,
            "Reading decoded"
        );

        for callback in self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            callback(&reading);
        }
        // No subscribers is fine.
        let _ = self.readings.send(reading);
    }

    /// Run one measurement cycle and return the first reading decoded during it.
    ///
    /// `Ok(None)` means the device stayed silent for the whole read timeout.
    pub(crate) async fn capture(&self) -> Result<Option<DeviceReading>, DeviceError> {
        // Subscribe before triggering so a fast notification is not missed.
        let mut rx = self.readings.subscribe();
        self.transition(ConnectionState::Connected, ConnectionState::Reading)?;

        if let Err(e) = self
            .transport
            .trigger_measurement(&self.info.mac_address, self.measurement)
            .await
        {
            return Err(self.fail(e));
        }

        let deadline = tokio::time::Instant::now() + self.profile.read_timeout;
        let reading = loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(reading)) => break Some(reading),
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::debug!(device_id = %self.info.device_id, skipped, "Reading subscriber lagged");
                }
                Ok(Err(RecvError::Closed)) => break None,
                Err(_) => {
                    tracing::debug!(
                        device_id = %self.info.device_id,
                        timeout_secs = self.profile.read_timeout.as_secs(),
                        "No reading before timeout"
                    );
                    break None;
                }
            }
        };

        // A concurrent disconnect or failure wins over the restore.
        let _ = self.transition(ConnectionState::Reading, ConnectionState::Connected);
        Ok(reading)
    }

    /// Start a measurement cycle and wait until a notification arrives or the
    /// read timeout elapses.
    ///
    /// The reading itself travels the notification path to callbacks and
    /// subscribers. Returns whether a reading arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotReady`] unless the device is connected and
    /// idle, or [`DeviceError::Transport`] if the trigger fails.
    pub async fn trigger_read(&self) -> Result<bool, DeviceError> {
        Ok(self.capture().await?.is_some())
    }

    /// Device self-test. Passes trivially for every supported class.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotReady`] unless the device is connected and idle.
    pub async fn calibrate(&self) -> Result<bool, DeviceError> {
        self.transition(ConnectionState::Connected, ConnectionState::Calibrating)?;
        tracing::info!(device_id = %self.info.device_id, "Device self-test passed");
        let _ = self.transition(ConnectionState::Calibrating, ConnectionState::Connected);
        Ok(true)
    }

    /// Read the battery level, giving up after `timeout`. Failures yield `None`.
    pub async fn battery_level(&self, timeout: Duration) -> Option<u8> {
        if !self.state().is_link_up() {
            return None;
        }
        match tokio::time::timeout(timeout, self.transport.read_battery_level(&self.info.mac_address)).await {
            Ok(Ok(level)) => level,
            Ok(Err(e)) => {
                tracing::debug!(device_id = %self.info.device_id, error = %e, "Battery read failed");
                None
            }
            Err(_) => None,
        }
    }
}
