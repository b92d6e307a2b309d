//! Continuous device health monitoring.
//!
//! A single background loop samples every driver in the manager at a fixed
//! interval and keeps a rolling window of [`HealthMetrics`] per device.
//! Health status is derived from the most recent sample.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::config::HealthConfig;
use crate::driver::DeviceDriver;
use crate::manager::DeviceManager;
use crate::types::{ConnectionState, DeviceInfo};

/// Floor for the polling period; a zero interval would spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Device health bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Latest quality at least 0.8.
    Healthy,
    /// Latest quality at least 0.6.
    Warning,
    /// Latest quality below 0.6.
    Critical,
    /// No samples in the window.
    Offline,
}

impl HealthStatus {
    /// Bucket a quality score.
    #[must_use]
    pub fn from_quality(quality: f64) -> Self {
        if quality >= 0.8 {
            Self::Healthy
        } else if quality >= 0.6 {
            Self::Warning
        } else {
            Self::Critical
        }
    }
}

/// One health sample for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HealthMetrics {
    /// Device sampled.
    pub device_id: String,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Quality derived from the connection state.
    pub quality_score: f64,
    /// Battery percentage, if the device reported one.
    pub battery_level: Option<u8>,
    /// Signal strength at the last sighting, in dBm.
    pub signal_strength: i16,
    /// Readings decoded since the driver was created.
    pub measurement_count: u64,
    /// Notifications that failed to decode.
    pub error_count: u64,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Seconds since the link came up.
    pub uptime_secs: Option<u64>,
    /// Firmware revision, if known.
    pub firmware_version: Option<String>,
}

/// Health of one device in a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeviceHealthReport {
    /// Device metadata.
    pub device_info: DeviceInfo,
    /// Connection state when the report was generated.
    pub connection_state: ConnectionState,
    /// Derived health bucket.
    pub health_status: HealthStatus,
    /// Most recent samples, oldest first.
    pub recent_metrics: Vec<HealthMetrics>,
}

/// Device counts per health bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct HealthSummary {
    /// Devices in the report.
    pub total_devices: usize,
    /// Healthy devices.
    pub healthy: usize,
    /// Devices with warnings.
    pub warning: usize,
    /// Critical devices.
    pub critical: usize,
    /// Devices without samples.
    pub offline: usize,
}

/// Health of every managed device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    /// When the report was generated.
    pub generated_at: DateTime<Utc>,
    /// Per-device health keyed by device id.
    pub devices: BTreeMap<String, DeviceHealthReport>,
    /// Bucket counts.
    pub summary: HealthSummary,
}

/// Background health poller.
pub struct HealthMonitor {
    manager: Arc<DeviceManager>,
    settings: HealthConfig,
    battery_timeout: Duration,
    metrics: RwLock<HashMap<String, VecDeque<HealthMetrics>>>,
    task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl HealthMonitor {
    /// Create a monitor over `manager`. Nothing runs until [`start`](Self::start).
    pub fn new(manager: Arc<DeviceManager>, settings: HealthConfig) -> Self {
        let battery_timeout = manager.settings().battery_timeout();
        Self {
            manager,
            settings,
            battery_timeout,
            metrics: RwLock::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    /// Start the polling loop. The first tick runs immediately.
    ///
    /// Calling `start` while the loop is running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            tracing::debug!("Health monitoring already running");
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run(token.clone()));
        *task = Some((handle, token));
        tracing::info!(interval_secs = self.settings.interval_secs, "Health monitoring started");
    }

    /// Stop the polling loop and wait for it to exit.
    ///
    /// A tick in progress is allowed to finish.
    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((handle, token)) = task else {
            return;
        };

        token.cancel();
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Health monitoring task failed");
        }
        tracing::info!("Health monitoring stopped");
    }

    /// Whether the polling loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval().max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    /// Sample every driver once.
    pub async fn tick(&self) {
        let drivers = self.manager.drivers().await;
        let now = Utc::now();
        for driver in &drivers {
            let metrics = self.sample(driver, now).await;
            self.record_sample(metrics, now);
        }
        self.evict_expired(now);
        tracing::debug!(devices = drivers.len(), "Health tick complete");
    }

    async fn sample(&self, driver: &DeviceDriver, now: DateTime<Utc>) -> HealthMetrics {
        let state = driver.state();
        let stats = driver.stats();
        let battery = driver.battery_level(self.battery_timeout).await;
        let info = driver.info();

        if state == ConnectionState::Error {
            tracing::warn!(device_id = %info.device_id, last_error = ?stats.last_error, "Device in error state");
        }

        HealthMetrics {
            device_id: info.device_id.clone(),
            timestamp: now,
            quality_score: state.health_quality(),
            battery_level: battery.or(info.battery_level),
            signal_strength: info.signal_strength,
            measurement_count: stats.readings_decoded,
            error_count: stats.decode_errors,
            last_error: stats.last_error,
            uptime_secs: stats
                .connected_since
                .and_then(|since| u64::try_from((now - since).num_seconds()).ok()),
            firmware_version: info.firmware_version.clone(),
        }
    }

    pub(crate) fn record_sample(&self, metrics: HealthMetrics, now: DateTime<Utc>) {
        let cutoff = now - self.settings.retention();
        let mut all = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        let window = all.entry(metrics.device_id.clone()).or_default();
        window.push_back(metrics);
        while window.front().is_some_and(|m| m.timestamp < cutoff) {
            window.pop_front();
        }
    }

    fn evict_expired(&self, now: DateTime<Utc>) {
        let cutoff = now - self.settings.retention();
        let mut all = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        for window in all.values_mut() {
            while window.front().is_some_and(|m| m.timestamp < cutoff) {
                window.pop_front();
            }
        }
        all.retain(|_, window| !window.is_empty());
    }

    /// Health of one device from its latest sample; `offline` without samples.
    #[must_use]
    pub fn get_device_health(&self, device_id: &str) -> HealthStatus {
        self.latest_metrics(device_id)
            .map_or(HealthStatus::Offline, |m| HealthStatus::from_quality(m.quality_score))
    }

    /// Latest sample for a device.
    #[must_use]
    pub fn latest_metrics(&self, device_id: &str) -> Option<HealthMetrics> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .and_then(|window| window.back().cloned())
    }

    /// Samples for a device taken within `window` of now, oldest first.
    #[must_use]
    pub fn get_health_metrics(&self, device_id: &str, window: TimeDelta) -> Vec<HealthMetrics> {
        let since = Utc::now() - window;
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|m| m.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn recent(&self, device_id: &str, count: usize) -> Vec<HealthMetrics> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .map(|samples| {
                let skip = samples.len().saturating_sub(count);
                samples.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Health of every managed device plus bucket counts.
    pub async fn generate_health_report(&self) -> HealthReport {
        let mut devices = BTreeMap::new();
        let mut summary = HealthSummary::default();

        for driver in self.manager.drivers().await {
            let device_id = driver.device_id().to_string();
            let health_status = self.get_device_health(&device_id);
            match health_status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Warning => summary.warning += 1,
                HealthStatus::Critical => summary.critical += 1,
                HealthStatus::Offline => summary.offline += 1,
            }
            summary.total_devices += 1;

            devices.insert(
                device_id.clone(),
                DeviceHealthReport {
                    device_info: driver.info().clone(),
                    connection_state: driver.state(),
                    health_status,
                    recent_metrics: self.recent(&device_id, self.settings.report_sample_count),
                },
            );
        }

        HealthReport {
            generated_at: Utc::now(),
            devices,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevicesConfig;
    use crate::sink::NullSink;
    use crate::transport::{SimulatedPeripheral, SimulatedTransport};

    const BP: &str = "AA:BB:CC:DD:EE:01";
    const THERMO: &str = "AA:BB:CC:DD:EE:02";

    fn setup() -> (SimulatedTransport, Arc<DeviceManager>, Arc<HealthMonitor>) {
        let transport = SimulatedTransport::new();
        transport.add_peripheral(SimulatedPeripheral::named(BP, "OMRON BP7250"));
        transport.add_peripheral(SimulatedPeripheral::named(THERMO, "Braun ThermoScan"));
        let manager = Arc::new(DeviceManager::new(
            Arc::new(transport.clone()),
            Arc::new(NullSink),
            DevicesConfig::default(),
        ));
        let monitor = Arc::new(HealthMonitor::new(Arc::clone(&manager), HealthConfig::default()));
        (transport, manager, monitor)
    }

    async fn connect(manager: &DeviceManager, address: &str) -> String {
        let info = manager
            .discover(Duration::from_secs(5))
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.mac_address == address)
            .unwrap();
        let _ = manager.connect(info.clone()).await;
        info.device_id
    }

    fn sample(device_id: &str, timestamp: DateTime<Utc>, quality_score: f64) -> HealthMetrics {
        HealthMetrics {
            device_id: device_id.to_string(),
            timestamp,
            quality_score,
            battery_level: None,
            signal_strength: -60,
            measurement_count: 0,
            error_count: 0,
            last_error: None,
            uptime_secs: None,
            firmware_version: None,
        }
    }

    #[test]
    fn test_status_buckets() {
        assert_eq!(HealthStatus::from_quality(0.9), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_quality(0.8), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_quality(0.6), HealthStatus::Warning);
        assert_eq!(HealthStatus::from_quality(0.59), HealthStatus::Critical);
        assert_eq!(HealthStatus::from_quality(0.0), HealthStatus::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_runs_immediately() {
        let (transport, manager, monitor) = setup();
        let bp = connect(&manager, BP).await;
        transport.set_battery_level(BP, Some(76));

        monitor.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(monitor.get_device_health(&bp), HealthStatus::Healthy);
        let latest = monitor.latest_metrics(&bp).unwrap();
        assert!((latest.quality_score - 0.8).abs() < f64::EPSILON);
        assert_eq!(latest.battery_level, Some(76));
        assert!(latest.uptime_secs.is_some());
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_runs_one_loop() {
        let (_transport, manager, monitor) = setup();
        let bp = connect(&manager, BP).await;

        monitor.start();
        monitor.start();
        assert!(monitor.is_running());
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(monitor.get_health_metrics(&bp, TimeDelta::hours(1)).len(), 2);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_polls_once_per_second() {
        let (_transport, manager, _) = setup();
        let bp = connect(&manager, BP).await;
        let settings = HealthConfig {
            interval_secs: 0,
            ..HealthConfig::default()
        };
        let monitor = Arc::new(HealthMonitor::new(Arc::clone(&manager), settings));

        monitor.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        monitor.stop().await;

        assert_eq!(monitor.get_health_metrics(&bp, TimeDelta::hours(1)).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_sampling() {
        let (_transport, manager, monitor) = setup();
        let bp = connect(&manager, BP).await;

        monitor.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        monitor.stop().await;
        assert!(!monitor.is_running());
        // Second stop is harmless.
        monitor.stop().await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(monitor.get_health_metrics(&bp, TimeDelta::hours(1)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_without_samples_is_offline() {
        let (_transport, manager, monitor) = setup();
        let bp = connect(&manager, BP).await;

        assert_eq!(monitor.get_device_health(&bp), HealthStatus::Offline);
        monitor.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        monitor.stop().await;
        assert_eq!(monitor.get_device_health("never-seen"), HealthStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_state_is_critical() {
        let (transport, manager, monitor) = setup();
        transport.set_connect_failure(THERMO, Some("bonding failed"));
        let thermo = connect(&manager, THERMO).await;

        monitor.tick().await;
        assert_eq!(monitor.get_device_health(&thermo), HealthStatus::Critical);
        let latest = monitor.latest_metrics(&thermo).unwrap();
        assert!(latest.last_error.unwrap().contains("bonding failed"));
    }

    #[tokio::test]
    async fn test_samples_older_than_retention_are_evicted() {
        let (_transport, _manager, monitor) = setup();
        let now = Utc::now();

        monitor.record_sample(sample("bp", now - TimeDelta::hours(30), 0.8), now - TimeDelta::hours(30));
        monitor.record_sample(sample("bp", now - TimeDelta::hours(2), 0.6), now - TimeDelta::hours(2));
        monitor.record_sample(sample("bp", now, 0.8), now);

        let window = monitor.get_health_metrics("bp", TimeDelta::hours(48));
        assert_eq!(window.len(), 2);
        assert_eq!(monitor.get_health_metrics("bp", TimeDelta::hours(1)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_counts_buckets_and_limits_samples() {
        let (transport, manager, monitor) = setup();
        let bp = connect(&manager, BP).await;
        transport.set_connect_failure(THERMO, Some("out of range"));
        let thermo = connect(&manager, THERMO).await;

        for _ in 0..12 {
            monitor.tick().await;
        }
        let report = monitor.generate_health_report().await;

        assert_eq!(report.summary.total_devices, 2);
        assert_eq!(report.summary.healthy, 1);
        assert_eq!(report.summary.critical, 1);
        assert_eq!(report.devices[&bp].recent_metrics.len(), 10);
        assert_eq!(report.devices[&bp].connection_state, ConnectionState::Connected);
        assert_eq!(report.devices[&thermo].health_status, HealthStatus::Critical);
    }
}
