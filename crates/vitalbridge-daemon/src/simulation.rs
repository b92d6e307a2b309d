//! Demo mode: simulated kiosk devices that produce plausible vitals.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use vitalbridge_core::transport::payloads;
use vitalbridge_core::{SimulatedPeripheral, SimulatedTransport};

/// Blood pressure cuff address.
pub const BLOOD_PRESSURE: &str = "C0:FF:EE:00:00:01";
/// Pulse oximeter address.
pub const PULSE_OXIMETER: &str = "C0:FF:EE:00:00:02";
/// Thermometer address.
pub const THERMOMETER: &str = "C0:FF:EE:00:00:03";

/// A transport populated with one device of each decodable class plus a
/// non-medical peripheral that discovery must ignore.
#[must_use]
pub fn demo_transport() -> SimulatedTransport {
    let transport = SimulatedTransport::with_measurement_delay(Duration::from_secs(3));

    let devices = [
        (BLOOD_PRESSURE, "OMRON BP7250", 92),
        (PULSE_OXIMETER, "Nonin 3230", 67),
        (THERMOMETER, "Braun ThermoScan 7", 41),
    ];
    for (address, name, battery) in devices {
        transport.add_peripheral(SimulatedPeripheral {
            battery_level: Some(battery),
            ..SimulatedPeripheral::named(address, name)
        });
    }
    transport.add_peripheral(SimulatedPeripheral::named("C0:FF:EE:00:00:99", "Kiosk Speaker"));
    transport
}

/// Payloads for the `step`th simulated measurement round.
///
/// Values drift slowly around normal adult vitals.
#[must_use]
pub fn round(step: u64) -> [(&'static str, Vec<u8>); 3] {
    let wobble = u16::try_from(step % 7).unwrap_or(0);
    #[allow(clippy::cast_precision_loss)]
    let temperature = 36.6 + (step % 5) as f32 * 0.1;

    [
        (
            BLOOD_PRESSURE,
            payloads::blood_pressure_mmhg(116 + wobble, 76 + wobble / 2, Some(68 + wobble)),
        ),
        (PULSE_OXIMETER, payloads::pulse_oximetry(9700 + wobble * 20, 70 + wobble)),
        (THERMOMETER, payloads::temperature_celsius(temperature)),
    ]
}

/// Emit one round of notifications every `period` until `shutdown` fires.
///
/// Rounds for devices without subscribers are silently dropped.
pub fn spawn_emitter(
    transport: SimulatedTransport,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut step = 0_u64;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let delivered: usize = round(step)
                        .iter()
                        .map(|(address, payload)| transport.emit(address, payload))
                        .sum();
                    tracing::debug!(step, delivered, "Simulated measurement round");
                    step += 1;
                }
            }
        }
        tracing::debug!("Simulation emitter stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vitalbridge_core::{ChannelSink, DeviceManager, DeviceType, DevicesConfig};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_demo_devices_are_identified() {
        let transport = demo_transport();
        let (sink, _rx) = ChannelSink::new();
        let manager = DeviceManager::new(
            Arc::new(transport.clone()),
            Arc::new(sink),
            DevicesConfig::default(),
        );

        let found = manager.discover(Duration::from_secs(5)).await.unwrap();
        let mut types: Vec<DeviceType> = found.iter().map(|d| d.device_type).collect();
        types.sort();
        assert_eq!(
            types,
            vec![
                DeviceType::BloodPressure,
                DeviceType::PulseOximeter,
                DeviceType::Thermometer
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_emitter_feeds_connected_devices() {
        let transport = demo_transport();
        let (sink, mut rx) = ChannelSink::new();
        let manager = DeviceManager::new(
            Arc::new(transport.clone()),
            Arc::new(sink),
            DevicesConfig::default(),
        );
        let found = manager.discover(Duration::from_secs(5)).await.unwrap();
        let oximeter = found
            .into_iter()
            .find(|d| d.mac_address == PULSE_OXIMETER)
            .unwrap();
        manager.connect(oximeter).await.unwrap();

        let shutdown = CancellationToken::new();
        let emitter = spawn_emitter(transport, Duration::from_secs(2), shutdown.clone());

        let reading = rx.recv().await.unwrap();
        assert_eq!(reading.device_type, DeviceType::PulseOximeter);
        assert!((reading.quality_score - 0.9).abs() < f64::EPSILON);

        shutdown.cancel();
        emitter.await.unwrap();
    }

    #[test]
    fn test_rounds_stay_plausible() {
        for step in 0..20 {
            let [(_, bp), (_, plx), (_, thermo)] = round(step);
            assert_eq!(bp.len(), 9);
            assert_eq!(plx.len(), 5);
            assert_eq!(thermo.len(), 5);
        }
    }
}
