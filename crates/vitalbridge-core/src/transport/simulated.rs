//! In-memory transport with scripted peripherals.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{Advertisement, NotificationHandler, Transport, TransportError};

/// A scripted peripheral.
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    /// Transport address.
    pub address: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength reported on every scan.
    pub rssi: i16,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Value of the Battery Level characteristic.
    pub battery_level: Option<u8>,
}

impl SimulatedPeripheral {
    /// A peripheral advertising only a name.
    pub fn named(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: Some(name.into()),
            rssi: -55,
            service_uuids: Vec::new(),
            battery_level: None,
        }
    }

    /// A nameless peripheral advertising one service.
    pub fn with_service(address: impl Into<String>, service: Uuid) -> Self {
        Self {
            address: address.into(),
            name: None,
            rssi: -60,
            service_uuids: vec![service],
            battery_level: None,
        }
    }
}

#[derive(Default)]
struct PeripheralState {
    peripheral: Option<SimulatedPeripheral>,
    connected: bool,
    subscriptions: HashMap<Uuid, NotificationHandler>,
    queued: VecDeque<Vec<u8>>,
    connect_failure: Option<String>,
    disconnect_failure: Option<String>,
    connect_delay: Duration,
    connects: usize,
}

type Peripherals = Arc<Mutex<HashMap<String, PeripheralState>>>;

/// Transport backed by in-memory peripherals.
///
/// Scans sleep for the requested duration on the tokio clock, so tests can
/// run them under paused time. Measurements queued with
/// [`queue_measurement`](Self::queue_measurement) are delivered one per
/// [`Transport::trigger_measurement`] call after `measurement_delay`.
#[derive(Clone)]
pub struct SimulatedTransport {
    peripherals: Peripherals,
    measurement_delay: Duration,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    /// Create an empty transport with a one second measurement delay.
    #[must_use]
    pub fn new() -> Self {
        Self::with_measurement_delay(Duration::from_secs(1))
    }

    /// Create an empty transport with the given measurement delay.
    #[must_use]
    pub fn with_measurement_delay(measurement_delay: Duration) -> Self {
        Self {
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            measurement_delay,
        }
    }

    fn with_state<R>(&self, address: &str, f: impl FnOnce(&mut PeripheralState) -> R) -> R {
        let mut peripherals = self.peripherals.lock().unwrap_or_else(PoisonError::into_inner);
        f(peripherals.entry(address.to_string()).or_default())
    }

    /// Make a peripheral visible to scans and connectable.
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        let address = peripheral.address.clone();
        self.with_state(&address, |state| state.peripheral = Some(peripheral));
    }

    /// Remove a peripheral. Its link and subscriptions are dropped.
    pub fn remove_peripheral(&self, address: &str) {
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    /// Make the next connects to `address` fail with `message`, or succeed again with `None`.
    pub fn set_connect_failure(&self, address: &str, message: Option<&str>) {
        self.with_state(address, |state| {
            state.connect_failure = message.map(str::to_string);
        });
    }

    /// Hold every connect to `address` for `delay` before the link comes up.
    pub fn set_connect_delay(&self, address: &str, delay: Duration) {
        self.with_state(address, |state| state.connect_delay = delay);
    }

    /// Number of connect attempts made to `address`.
    #[must_use]
    pub fn connect_count(&self, address: &str) -> usize {
        self.with_state(address, |state| state.connects)
    }

    /// Make disconnects from `address` fail with `message`, or succeed again with `None`.
    pub fn set_disconnect_failure(&self, address: &str, message: Option<&str>) {
        self.with_state(address, |state| {
            state.disconnect_failure = message.map(str::to_string);
        });
    }

    /// Change the value of a peripheral's Battery Level characteristic.
    pub fn set_battery_level(&self, address: &str, level: Option<u8>) {
        self.with_state(address, |state| {
            if let Some(p) = state.peripheral.as_mut() {
                p.battery_level = level;
            }
        });
    }

    /// Queue a payload to be notified on the next measurement trigger.
    pub fn queue_measurement(&self, address: &str, payload: Vec<u8>) {
        self.with_state(address, |state| state.queued.push_back(payload));
    }

    /// Number of queued payloads not yet delivered.
    #[must_use]
    pub fn queued_measurements(&self, address: &str) -> usize {
        self.with_state(address, |state| state.queued.len())
    }

    /// Notify every subscriber of `address` immediately.
    ///
    /// Returns the number of handlers invoked.
    pub fn emit(&self, address: &str, payload: &[u8]) -> usize {
        let handlers: Vec<NotificationHandler> = self.with_state(address, |state| {
            state.subscriptions.values().cloned().collect()
        });
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    /// Whether the peripheral currently has a link.
    #[must_use]
    pub fn is_connected(&self, address: &str) -> bool {
        self.with_state(address, |state| state.connected)
    }

    /// Number of active notification subscriptions on `address`.
    #[must_use]
    pub fn subscription_count(&self, address: &str) -> usize {
        self.with_state(address, |state| state.subscriptions.len())
    }
}

fn notify(peripherals: &Peripherals, address: &str, characteristic: Uuid, payload: &[u8]) {
    let handler = peripherals
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(address)
        .and_then(|state| state.subscriptions.get(&characteristic).cloned());

    match handler {
        Some(handler) => handler(payload),
        None => tracing::debug!(address, %characteristic, "Simulated notification dropped, no subscriber"),
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>, TransportError> {
        tokio::time::sleep(duration).await;

        let peripherals = self.peripherals.lock().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<Advertisement> = peripherals
            .values()
            .filter_map(|state| state.peripheral.as_ref())
            .map(|p| Advertisement {
                address: p.address.clone(),
                name: p.name.clone(),
                rssi: Some(p.rssi),
                service_uuids: p.service_uuids.clone(),
            })
            .collect();
        found.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(found)
    }

    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let delay = self.with_state(address, |state| {
            state.connects += 1;
            state.connect_delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.with_state(address, |state| {
            if state.peripheral.is_none() {
                return Err(TransportError::ConnectFailed {
                    address: address.to_string(),
                    message: "peripheral not in range".to_string(),
                });
            }
            if let Some(message) = &state.connect_failure {
                return Err(TransportError::ConnectFailed {
                    address: address.to_string(),
                    message: message.clone(),
                });
            }
            state.connected = true;
            Ok(())
        })
    }

    async fn subscribe(
        &self,
        address: &str,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        self.with_state(address, |state| {
            if !state.connected {
                return Err(TransportError::NotConnected {
                    address: address.to_string(),
                });
            }
            state.subscriptions.insert(characteristic, handler);
            Ok(())
        })
    }

    async fn unsubscribe(&self, address: &str, characteristic: Uuid) -> Result<(), TransportError> {
        self.with_state(address, |state| {
            state.subscriptions.remove(&characteristic);
        });
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), TransportError> {
        self.with_state(address, |state| {
            if let Some(message) = &state.disconnect_failure {
                return Err(TransportError::DisconnectFailed {
                    address: address.to_string(),
                    message: message.clone(),
                });
            }
            state.subscriptions.clear();
            state.connected = false;
            Ok(())
        })
    }

    async fn trigger_measurement(
        &self,
        address: &str,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let payload = self.with_state(address, |state| {
            if state.connected {
                Ok(state.queued.pop_front())
            } else {
                Err(TransportError::NotConnected {
                    address: address.to_string(),
                })
            }
        })?;

        if let Some(payload) = payload {
            let peripherals = Arc::clone(&self.peripherals);
            let address = address.to_string();
            let delay = self.measurement_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                notify(&peripherals, &address, characteristic, &payload);
            });
        }
        Ok(())
    }

    async fn read_battery_level(&self, address: &str) -> Result<Option<u8>, TransportError> {
        self.with_state(address, |state| {
            if !state.connected {
                return Err(TransportError::NotConnected {
                    address: address.to_string(),
                });
            }
            Ok(state.peripheral.as_ref().and_then(|p| p.battery_level))
        })
    }
}

/// Builders for well-formed measurement payloads.
pub mod payloads {
    /// Blood pressure in mmHg, with an optional pulse rate.
    #[must_use]
    pub fn blood_pressure_mmhg(systolic: u16, diastolic: u16, pulse_rate: Option<u16>) -> Vec<u8> {
        let mean = (u32::from(systolic) + 2 * u32::from(diastolic)) / 3;
        let mean = u16::try_from(mean).unwrap_or(u16::MAX);
        let flags = if pulse_rate.is_some() { 0x04 } else { 0x00 };

        let mut payload = vec![flags];
        payload.extend_from_slice(&systolic.to_le_bytes());
        payload.extend_from_slice(&diastolic.to_le_bytes());
        payload.extend_from_slice(&mean.to_le_bytes());
        if let Some(pulse) = pulse_rate {
            payload.extend_from_slice(&pulse.to_le_bytes());
        }
        payload
    }

    /// Blood pressure in raw kPa units (value × 1000).
    #[must_use]
    pub fn blood_pressure_kpa(systolic: u16, diastolic: u16, mean: u16) -> Vec<u8> {
        let mut payload = vec![0x01];
        payload.extend_from_slice(&systolic.to_le_bytes());
        payload.extend_from_slice(&diastolic.to_le_bytes());
        payload.extend_from_slice(&mean.to_le_bytes());
        payload
    }

    /// Pulse oximetry with SpO2 in hundredths of a percent.
    #[must_use]
    pub fn pulse_oximetry(spo2_hundredths: u16, pulse_rate: u16) -> Vec<u8> {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&spo2_hundredths.to_le_bytes());
        payload.extend_from_slice(&pulse_rate.to_le_bytes());
        payload
    }

    /// Temperature in Celsius.
    #[must_use]
    pub fn temperature_celsius(celsius: f32) -> Vec<u8> {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&celsius.to_le_bytes());
        payload
    }

    /// Temperature in Fahrenheit.
    #[must_use]
    pub fn temperature_fahrenheit(fahrenheit: f32) -> Vec<u8> {
        let mut payload = vec![0x01];
        payload.extend_from_slice(&fahrenheit.to_le_bytes());
        payload
    }
}
