//! Directory of discovered devices and active drivers.
//!
//! The manager identifies medical devices during discovery, builds a
//! [`DeviceDriver`] per connected device, and fans every decoded reading out
//! to the configured [`ReadingSink`]. The driver table is the only shared
//! mutable state in the integration layer; link operations always run
//! outside its lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{is_valid_mac_address, DevicesConfig};
use crate::driver::{DeviceDriver, DeviceError};
use crate::profile;
use crate::sink::ReadingSink;
use crate::transport::{Advertisement, Transport};
use crate::types::{ConnectionState, DeviceInfo, DeviceReading, DeviceType};

/// Signal strength recorded when a scan does not report one.
const UNKNOWN_RSSI: i16 = -127;

/// Manufacturer recorded for devices identified by service UUID alone.
const UNKNOWN_MANUFACTURER: &str = "Unknown";

/// Owns the discovery directory and the table of active drivers.
pub struct DeviceManager {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn ReadingSink>,
    settings: DevicesConfig,
    drivers: RwLock<HashMap<String, Arc<DeviceDriver>>>,
    /// Keyed by transport address so a re-sighted device keeps its id.
    discovered: RwLock<HashMap<String, DeviceInfo>>,
}

impl DeviceManager {
    /// Create a manager over `transport`, delivering readings to `sink`.
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ReadingSink>,
        settings: DevicesConfig,
    ) -> Self {
        Self {
            transport,
            sink,
            settings,
            drivers: RwLock::new(HashMap::new()),
            discovered: RwLock::new(HashMap::new()),
        }
    }

    /// Discovery and connection settings in use.
    #[must_use]
    pub const fn settings(&self) -> &DevicesConfig {
        &self.settings
    }

    fn identify(&self, ad: &Advertisement) -> Option<(DeviceType, String)> {
        if let Some(name) = &ad.name {
            if let Some(pattern) = self.settings.name_patterns.iter().find(|p| p.matches(name)) {
                return Some((pattern.device_type, pattern.manufacturer()));
            }
        }
        profile::identify_by_service(&ad.service_uuids)
            .map(|device_type| (device_type, UNKNOWN_MANUFACTURER.to_string()))
    }

    /// Scan for `duration` and return every medical device seen.
    ///
    /// Devices are identified by advertised name first, then by standard
    /// service UUID. Unidentified devices are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Discovery`] if the scan fails.
    pub async fn discover(&self, duration: Duration) -> Result<Vec<DeviceInfo>, DeviceError> {
        tracing::info!(duration_secs = duration.as_secs(), "Starting device discovery");
        let advertisements = self.transport.scan(duration).await.map_err(|source| {
            tracing::error!(error = %source, "Discovery scan failed");
            DeviceError::Discovery { source }
        })?;

        let now = Utc::now();
        let mut directory = self.discovered.write().await;
        let mut found = Vec::new();

        for ad in advertisements {
            let Some((device_type, manufacturer)) = self.identify(&ad) else {
                tracing::trace!(address = %ad.address, name = ?ad.name, "Ignoring unidentified device");
                continue;
            };

            let info = directory
                .entry(ad.address.clone())
                .and_modify(|info| {
                    info.last_seen = now;
                    if let Some(rssi) = ad.rssi {
                        info.signal_strength = rssi;
                    }
                })
                .or_insert_with(|| {
                    let name = ad.name.clone().unwrap_or_else(|| device_type.to_string());
                    tracing::info!(
                        address = %ad.address,
                        %device_type,
                        name = %name,
                        "Discovered medical device"
                    );
                    DeviceInfo {
                        device_id: Uuid::new_v4().to_string(),
                        model: name.clone(),
                        name,
                        manufacturer,
                        device_type,
                        mac_address: ad.address.clone(),
                        signal_strength: ad.rssi.unwrap_or(UNKNOWN_RSSI),
                        battery_level: None,
                        firmware_version: None,
                        last_seen: now,
                        is_paired: false,
                    }
                });
            found.push(info.clone());
        }

        tracing::info!(count = found.len(), "Discovery complete");
        Ok(found)
    }

    /// Connect to a device and start routing its readings to the sink.
    ///
    /// Connecting a device that is already connecting or live is a no-op. A
    /// failed connect leaves the driver in the table in `error`; calling
    /// again retries it. The driver is claimed for connecting while the table
    /// lock is held, so concurrent calls for one device open one link.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidAddress`],
    /// [`DeviceError::UnsupportedDeviceType`], the transport failure, or
    /// [`DeviceError::NotReady`] when a disconnect cancelled the attempt.
    pub async fn connect(&self, info: DeviceInfo) -> Result<(), DeviceError> {
        if !is_valid_mac_address(&info.mac_address) {
            return Err(DeviceError::InvalidAddress {
                address: info.mac_address,
            });
        }

        let driver = {
            let mut drivers = self.drivers.write().await;
            if let Some(existing) = drivers.get(&info.device_id) {
                if existing.begin_connect().is_err() {
                    tracing::debug!(device_id = %info.device_id, state = %existing.state(), "Device already connected");
                    return Ok(());
                }
                Arc::clone(existing)
            } else {
                let driver = Arc::new(
                    DeviceDriver::new(
                        info.clone(),
                        Arc::clone(&self.transport),
                        self.settings.connect_timeout(),
                    )
                    .inspect_err(|e| {
                        tracing::warn!(device_id = %info.device_id, error = %e, "Refusing to connect");
                    })?,
                );
                driver.begin_connect()?;
                self.attach_sink(&driver);
                drivers.insert(info.device_id.clone(), Arc::clone(&driver));
                driver
            }
        };

        driver.establish().await
    }

    /// Connect a previously discovered device by id.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotFound`] for an unknown id, otherwise as
    /// [`connect`](Self::connect).
    pub async fn connect_by_id(&self, device_id: &str) -> Result<(), DeviceError> {
        let info = self
            .discovered
            .read()
            .await
            .values()
            .find(|info| info.device_id == device_id)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound {
                device_id: device_id.to_string(),
            })?;
        self.connect(info).await
    }

    fn attach_sink(&self, driver: &DeviceDriver) {
        let sink = Arc::clone(&self.sink);
        let runtime = tokio::runtime::Handle::current();
        driver.add_callback(Box::new(move |reading: &DeviceReading| {
            let sink = Arc::clone(&sink);
            let reading = reading.clone();
            runtime.spawn(async move {
                let device_id = reading.device_id.clone();
                if let Err(e) = sink.store(reading).await {
                    tracing::error!(%device_id, error = %e, "Failed to deliver reading to sink");
                }
            });
        }));
    }

    /// Disconnect a device and drop its driver.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotFound`] for an unknown id, or the transport
    /// failure (the driver then stays in the table in `error`).
    pub async fn disconnect(&self, device_id: &str) -> Result<(), DeviceError> {
        let driver = self.driver(device_id).await?;
        driver.disconnect().await?;

        let mut drivers = self.drivers.write().await;
        let released = drivers.get(device_id).is_some_and(|current| {
            Arc::ptr_eq(current, &driver) && current.state() == ConnectionState::Disconnected
        });
        if released {
            drivers.remove(device_id);
        }
        Ok(())
    }

    /// Run one measurement cycle and return the first reading decoded during it.
    ///
    /// `Ok(None)` when the device is busy, not connected, or stays silent
    /// for its read timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotFound`] for an unknown id, or the transport
    /// failure if the measurement could not be triggered.
    pub async fn read(&self, device_id: &str) -> Result<Option<DeviceReading>, DeviceError> {
        let driver = self.driver(device_id).await?;
        match driver.capture().await {
            Err(DeviceError::NotReady { state, .. }) => {
                tracing::debug!(device_id, %state, "Device not ready for a reading");
                Ok(None)
            }
            other => other,
        }
    }

    /// Run a device self-test.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotFound`] or [`DeviceError::NotReady`].
    pub async fn self_test(&self, device_id: &str) -> Result<bool, DeviceError> {
        self.driver(device_id).await?.calibrate().await
    }

    /// Read a device's battery level, recording it in the discovery directory.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotFound`] for an unknown id.
    pub async fn battery_level(&self, device_id: &str) -> Result<Option<u8>, DeviceError> {
        let driver = self.driver(device_id).await?;
        let level = driver.battery_level(self.settings.battery_timeout()).await;
        if level.is_some() {
            if let Some(info) = self
                .discovered
                .write()
                .await
                .get_mut(&driver.info().mac_address)
            {
                info.battery_level = level;
            }
        }
        Ok(level)
    }

    /// The driver for `device_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotFound`] when no driver exists.
    pub async fn driver(&self, device_id: &str) -> Result<Arc<DeviceDriver>, DeviceError> {
        self.drivers
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound {
                device_id: device_id.to_string(),
            })
    }

    /// Snapshot of every driver in the table.
    pub async fn drivers(&self) -> Vec<Arc<DeviceDriver>> {
        self.drivers.read().await.values().cloned().collect()
    }

    /// Connection state of a device with a driver.
    pub async fn device_state(&self, device_id: &str) -> Option<ConnectionState> {
        self.drivers
            .read()
            .await
            .get(device_id)
            .map(|driver| driver.state())
    }

    /// Metadata for a device with a driver or in the discovery directory.
    pub async fn device_info(&self, device_id: &str) -> Option<DeviceInfo> {
        if let Some(driver) = self.drivers.read().await.get(device_id) {
            return Some(driver.info().clone());
        }
        self.discovered
            .read()
            .await
            .values()
            .find(|info| info.device_id == device_id)
            .cloned()
    }

    /// Devices whose link is up.
    pub async fn connected_devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .drivers
            .read()
            .await
            .values()
            .filter(|driver| driver.state().is_link_up())
            .map(|driver| driver.info().clone())
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    /// Every device in the discovery directory.
    pub async fn discovered_devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self.discovered.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    /// Drop directory entries last seen before `cutoff` that have no driver.
    ///
    /// Returns how many entries were removed. Never called automatically.
    pub async fn prune_discovered(&self, cutoff: DateTime<Utc>) -> usize {
        let active: Vec<String> = self.drivers.read().await.keys().cloned().collect();
        let mut directory = self.discovered.write().await;
        let before = directory.len();
        directory.retain(|_, info| info.last_seen >= cutoff || active.contains(&info.device_id));
        let removed = before - directory.len();
        if removed > 0 {
            tracing::info!(removed, "Pruned stale discovery entries");
        }
        removed
    }

    /// Disconnect and drop every driver.
    pub async fn shutdown(&self) {
        let drivers: Vec<Arc<DeviceDriver>> =
            self.drivers.write().await.drain().map(|(_, d)| d).collect();
        for driver in drivers {
            if let Err(e) = driver.disconnect().await {
                tracing::warn!(device_id = %driver.device_id(), error = %e, "Disconnect during shutdown failed");
            }
        }
        tracing::info!("Device manager shut down");
    }
}
