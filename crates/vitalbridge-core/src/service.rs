//! Collaborator-facing facade over the integration layer.
//!
//! [`DeviceService`] is constructed explicitly from a [`KioskConfig`], a
//! transport and a sink. It owns the device manager, the calibrator and the
//! health monitor, and reports every failure as a [`BridgeError`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::calibration::{CalibrationOptions, CalibrationRecord, CalibrationStatus, Calibrator};
use crate::config::KioskConfig;
use crate::error::Result;
use crate::health::{HealthMonitor, HealthReport, HealthStatus};
use crate::manager::DeviceManager;
use crate::sink::ReadingSink;
use crate::storage::LedgerStore;
use crate::transport::Transport;
use crate::types::{ConnectionState, DeviceInfo, DeviceReading, DeviceType};
use crate::BridgeError;

/// A calibration request from a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CalibrationRequest {
    /// Device to calibrate.
    pub device_id: String,
    /// Device class the caller expects the device to be.
    pub device_type: DeviceType,
    /// Reference values keyed by field name.
    pub reference_values: BTreeMap<String, f64>,
    /// Run attributes.
    #[serde(default, flatten)]
    pub options: CalibrationOptions,
}

/// Combined view of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeviceStatus {
    /// Device metadata.
    pub info: DeviceInfo,
    /// Link state; `disconnected` for devices without a driver.
    pub connection_state: ConnectionState,
    /// Health bucket from the latest sample.
    pub health_status: HealthStatus,
    /// Current calibration status.
    pub calibration_status: CalibrationStatus,
    /// Battery percentage from the latest health sample or sighting.
    pub battery_level: Option<u8>,
}

/// Entry point for collaborators of the integration layer.
pub struct DeviceService {
    manager: Arc<DeviceManager>,
    calibrator: Calibrator,
    monitor: Arc<HealthMonitor>,
}

impl std::fmt::Debug for DeviceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceService").finish_non_exhaustive()
    }
}

impl DeviceService {
    /// Wire up a service from configuration.
    ///
    /// The configuration is validated first. When `calibration.persist_ledger` is set, ledgers are reloaded from
    /// `calibration.ledger_dir` (or the platform data directory).
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ConfigValidationError`] for an invalid
    /// configuration, or [`BridgeError::PersistenceError`] if persisted
    /// ledgers cannot be located or read.
    pub fn new(
        config: &KioskConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ReadingSink>,
    ) -> Result<Self> {
        config.validate()?;
        let manager = Arc::new(DeviceManager::new(transport, sink, config.devices.clone()));

        let store = if config.calibration.persist_ledger {
            Some(match &config.calibration.ledger_dir {
                Some(dir) => LedgerStore::new(dir),
                None => LedgerStore::default_location()?,
            })
        } else {
            None
        };

        let calibrator = Calibrator::new(Arc::clone(&manager), store)?;
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&manager),
            config.health.clone(),
        ));

        Ok(Self {
            manager,
            calibrator,
            monitor,
        })
    }

    /// The underlying device manager.
    #[must_use]
    pub const fn manager(&self) -> &Arc<DeviceManager> {
        &self.manager
    }

    // =========================================================================
    // DEVICES
    // =========================================================================

    /// Scan for medical devices.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the scan cannot run.
    pub async fn discover(&self, duration: Duration) -> Result<Vec<DeviceInfo>> {
        Ok(self.manager.discover(duration).await?)
    }

    /// Connect to a discovered device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device type has no decoder, the address is
    /// malformed or the link cannot be established.
    pub async fn connect(&self, info: DeviceInfo) -> Result<()> {
        Ok(self.manager.connect(info).await?)
    }

    /// Connect to a device from the discovery directory by id.
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect), plus [`BridgeError::DeviceNotFound`].
    pub async fn connect_by_id(&self, device_id: &str) -> Result<()> {
        Ok(self.manager.connect_by_id(device_id).await?)
    }

    /// Disconnect a device.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceNotFound`] for unknown devices or a
    /// transport error if teardown fails.
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        Ok(self.manager.disconnect(device_id).await?)
    }

    /// Capture one reading. `None` if the device produced nothing in time or
    /// is not ready.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceNotFound`] or a transport error.
    pub async fn read(&self, device_id: &str) -> Result<Option<DeviceReading>> {
        Ok(self.manager.read(device_id).await?)
    }

    /// Run the device's self-test.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceNotFound`] or
    /// [`BridgeError::DeviceNotReady`].
    pub async fn self_test(&self, device_id: &str) -> Result<bool> {
        Ok(self.manager.self_test(device_id).await?)
    }

    /// Combined connection, health and calibration view of one device.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceNotFound`] if the device was never seen.
    pub async fn device_status(&self, device_id: &str) -> Result<DeviceStatus> {
        let info = self
            .manager
            .device_info(device_id)
            .await
            .ok_or_else(|| BridgeError::DeviceNotFound(device_id.to_string()))?;
        Ok(self.status_of(info).await)
    }

    /// Status of every connected or discovered device, by device id.
    pub async fn device_statuses(&self) -> Vec<DeviceStatus> {
        let mut infos: BTreeMap<String, DeviceInfo> = self
            .manager
            .discovered_devices()
            .await
            .into_iter()
            .map(|info| (info.device_id.clone(), info))
            .collect();
        for driver in self.manager.drivers().await {
            infos.insert(driver.device_id().to_string(), driver.info().clone());
        }

        let mut statuses = Vec::with_capacity(infos.len());
        for info in infos.into_values() {
            statuses.push(self.status_of(info).await);
        }
        statuses
    }

    async fn status_of(&self, info: DeviceInfo) -> DeviceStatus {
        let connection_state = self
            .manager
            .device_state(&info.device_id)
            .await
            .unwrap_or(ConnectionState::Disconnected);
        let battery_level = self
            .monitor
            .latest_metrics(&info.device_id)
            .and_then(|m| m.battery_level)
            .or(info.battery_level);

        DeviceStatus {
            connection_state,
            health_status: self.monitor.get_device_health(&info.device_id),
            calibration_status: self.calibrator.check_calibration_status(&info.device_id),
            battery_level,
            info,
        }
    }

    // =========================================================================
    // CALIBRATION
    // =========================================================================

    /// Calibrate a blood pressure monitor against reference pressures.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot start; failed runs are returned as
    /// `calibration_failed` records instead.
    pub async fn calibrate_blood_pressure(
        &self,
        device_id: &str,
        reference_systolic: f64,
        reference_diastolic: f64,
    ) -> Result<CalibrationRecord> {
        Ok(self
            .calibrator
            .calibrate_blood_pressure(device_id, reference_systolic, reference_diastolic)
            .await?)
    }

    /// Calibrate a pulse oximeter against reference SpO2 and pulse rate.
    ///
    /// # Errors
    ///
    /// As [`calibrate_blood_pressure`](Self::calibrate_blood_pressure).
    pub async fn calibrate_pulse_oximeter(
        &self,
        device_id: &str,
        reference_spo2: f64,
        reference_pulse_rate: f64,
    ) -> Result<CalibrationRecord> {
        Ok(self
            .calibrator
            .calibrate_pulse_oximeter(device_id, reference_spo2, reference_pulse_rate)
            .await?)
    }

    /// Calibrate any supported device class.
    ///
    /// # Errors
    ///
    /// As [`calibrate_blood_pressure`](Self::calibrate_blood_pressure).
    pub async fn calibrate(&self, request: CalibrationRequest) -> Result<CalibrationRecord> {
        Ok(self
            .calibrator
            .calibrate(
                &request.device_id,
                request.device_type,
                request.reference_values,
                request.options,
            )
            .await?)
    }

    /// Current calibration status of a device.
    #[must_use]
    pub fn get_calibration_status(&self, device_id: &str) -> CalibrationStatus {
        self.calibrator.check_calibration_status(device_id)
    }

    /// Every calibration record of a device, oldest first.
    #[must_use]
    pub fn get_calibration_history(&self, device_id: &str) -> Vec<CalibrationRecord> {
        self.calibrator.history(device_id)
    }

    // =========================================================================
    // HEALTH
    // =========================================================================

    /// Start the background health loop.
    pub fn start_health_monitoring(&self) {
        self.monitor.start();
    }

    /// Stop the background health loop and wait for it.
    pub async fn stop_health_monitoring(&self) {
        self.monitor.stop().await;
    }

    /// Health bucket of one device.
    #[must_use]
    pub fn get_device_health(&self, device_id: &str) -> HealthStatus {
        self.monitor.get_device_health(device_id)
    }

    /// Health of every managed device.
    pub async fn get_health_report(&self) -> HealthReport {
        self.monitor.generate_health_report().await
    }

    /// Stop background work and disconnect every device.
    ///
    /// Running calibrations are interrupted and recorded as failed.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down device service");
        self.calibrator.cancel_all();
        self.monitor.stop().await;
        self.manager.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_ok;

    use super::*;
    use crate::codec::fields;
    use crate::sink::ChannelSink;
    use crate::transport::{payloads, SimulatedPeripheral, SimulatedTransport};

    const BP: &str = "AA:BB:CC:DD:EE:01";
    const THERMO: &str = "AA:BB:CC:DD:EE:05";

    fn setup(config: &KioskConfig) -> (SimulatedTransport, DeviceService) {
        let transport = SimulatedTransport::with_measurement_delay(Duration::from_millis(500));
        transport.add_peripheral(SimulatedPeripheral::named(BP, "OMRON BP7250"));
        transport.add_peripheral(SimulatedPeripheral::named(THERMO, "Braun ThermoScan"));
        let (sink, _rx) = ChannelSink::new();
        let service = DeviceService::new(config, Arc::new(transport.clone()), Arc::new(sink))
            .unwrap();
        (transport, service)
    }

    async fn connect(service: &DeviceService, address: &str) -> String {
        let info = service
            .discover(Duration::from_secs(5))
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.mac_address == address)
            .unwrap();
        let device_id = info.device_id.clone();
        assert_ok!(service.connect(info).await);
        device_id
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = KioskConfig::default();
        config.health.interval_secs = 0;
        let (sink, _rx) = ChannelSink::new();

        let err = DeviceService::new(&config, Arc::new(SimulatedTransport::new()), Arc::new(sink))
            .unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("health.interval_secs"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_is_a_lookup_error() {
        let (_transport, service) = setup(&KioskConfig::default());

        let err = service.read("missing").await.unwrap_err();
        assert!(err.is_lookup_error());

        let err = service.device_status("missing").await.unwrap_err();
        assert!(err.is_lookup_error());
        assert_eq!(service.get_calibration_status("missing"), CalibrationStatus::Unknown);
        assert_eq!(service.get_device_health("missing"), HealthStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_statuses_cover_discovered_and_connected() {
        let (transport, service) = setup(&KioskConfig::default());
        transport.set_battery_level(BP, Some(81));
        let bp = connect(&service, BP).await;

        let statuses = service.device_statuses().await;
        assert_eq!(statuses.len(), 2);

        let status = assert_ok!(service.device_status(&bp).await);
        assert_eq!(status.connection_state, ConnectionState::Connected);
        assert_eq!(status.calibration_status, CalibrationStatus::Unknown);
        assert_eq!(status.health_status, HealthStatus::Offline);

        service.start_health_monitoring();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = service.device_status(&bp).await.unwrap();
        assert_eq!(status.health_status, HealthStatus::Healthy);
        assert_eq!(status.battery_level, Some(81));

        let thermo = statuses
            .iter()
            .find(|s| s.info.mac_address == THERMO)
            .unwrap();
        assert_eq!(thermo.connection_state, ConnectionState::Disconnected);

        service.shutdown().await;
    }

    fn blood_pressure_request(device_id: &str) -> CalibrationRequest {
        CalibrationRequest {
            device_id: device_id.to_string(),
            device_type: DeviceType::BloodPressure,
            reference_values: BTreeMap::from([
                (fields::SYSTOLIC.to_string(), 120.0),
                (fields::DIASTOLIC.to_string(), 80.0),
            ]),
            options: CalibrationOptions {
                technician_id: Some("tech-3".into()),
                ..CalibrationOptions::default()
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibrate_request() {
        let (transport, service) = setup(&KioskConfig::default());
        let bp = connect(&service, BP).await;
        for _ in 0..5 {
            transport.queue_measurement(BP, payloads::blood_pressure_mmhg(121, 80, Some(70)));
        }

        let record = service.calibrate(blood_pressure_request(&bp)).await.unwrap();

        assert_eq!(record.status, CalibrationStatus::Calibrated);
        assert_eq!(record.technician_id.as_deref(), Some("tech-3"));
        assert_eq!(service.get_calibration_history(&bp), vec![record]);
        assert_eq!(
            service.get_calibration_status(&bp),
            CalibrationStatus::Calibrated
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_thermometer_has_no_procedure() {
        let (_transport, service) = setup(&KioskConfig::default());
        let thermo = connect(&service, THERMO).await;

        let err = service
            .calibrate(CalibrationRequest {
                device_id: thermo.clone(),
                device_type: DeviceType::Thermometer,
                reference_values: BTreeMap::from([(fields::TEMPERATURE.to_string(), 37.0)]),
                options: CalibrationOptions::default(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED_DEVICE_TYPE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibrate_wrong_type_is_refused() {
        let (_transport, service) = setup(&KioskConfig::default());
        let thermo = connect(&service, THERMO).await;

        let err = service
            .calibrate_blood_pressure(&thermo, 120.0, 80.0)
            .await
            .unwrap_err();
        assert!(err.is_calibration_error());
        assert!(service.get_calibration_history(&thermo).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_ledger_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KioskConfig::default();
        config.calibration.persist_ledger = true;
        config.calibration.ledger_dir = Some(dir.path().to_path_buf());

        let (transport, service) = setup(&config);
        let bp = connect(&service, BP).await;
        for _ in 0..5 {
            transport.queue_measurement(BP, payloads::blood_pressure_mmhg(120, 80, None));
        }
        let record = service.calibrate(blood_pressure_request(&bp)).await.unwrap();
        service.shutdown().await;

        let (_transport, restarted) = setup(&config);
        assert_eq!(restarted.get_calibration_history(&bp), vec![record]);
        assert_eq!(
            restarted.get_calibration_status(&bp),
            CalibrationStatus::Calibrated
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_devices() {
        let (transport, service) = setup(&KioskConfig::default());
        connect(&service, BP).await;
        assert!(transport.is_connected(BP));

        service.start_health_monitoring();
        service.shutdown().await;
        assert!(!transport.is_connected(BP));
    }
}
