//! Bluetooth SIG profile table per device class.
//!
//! Which GATT service identifies a device class, which characteristic carries
//! its measurements, and how long a measurement cycle may take.

use std::time::Duration;

use uuid::Uuid;

use crate::types::DeviceType;

/// Bluetooth base UUID `0000xxxx-0000-1000-8000-00805f9b34fb`.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit SIG-assigned number into a full UUID.
#[must_use]
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Battery Level characteristic (0x2A19).
pub const BATTERY_LEVEL: Uuid = sig_uuid(0x2A19);

/// Default time a measurement cycle may take before it is abandoned.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Protocol facts for one device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Device class.
    pub device_type: DeviceType,
    /// Primary GATT service advertised by the device.
    pub service: Option<Uuid>,
    /// Characteristic whose notifications carry measurements.
    pub measurement: Option<Uuid>,
    /// Upper bound on one measurement cycle.
    pub read_timeout: Duration,
}

const PROFILES: [DeviceProfile; 6] = [
    DeviceProfile {
        device_type: DeviceType::BloodPressure,
        service: Some(sig_uuid(0x1810)),
        measurement: Some(sig_uuid(0x2A35)),
        read_timeout: DEFAULT_READ_TIMEOUT,
    },
    DeviceProfile {
        device_type: DeviceType::PulseOximeter,
        service: Some(sig_uuid(0x1822)),
        // PLX continuous measurement
        measurement: Some(sig_uuid(0x2A5F)),
        read_timeout: DEFAULT_READ_TIMEOUT,
    },
    DeviceProfile {
        device_type: DeviceType::Thermometer,
        service: Some(sig_uuid(0x1809)),
        measurement: Some(sig_uuid(0x2A1C)),
        read_timeout: DEFAULT_READ_TIMEOUT,
    },
    DeviceProfile {
        device_type: DeviceType::WeightScale,
        service: Some(sig_uuid(0x181D)),
        measurement: Some(sig_uuid(0x2A9D)),
        read_timeout: DEFAULT_READ_TIMEOUT,
    },
    DeviceProfile {
        device_type: DeviceType::HeightMeter,
        service: None,
        measurement: None,
        read_timeout: DEFAULT_READ_TIMEOUT,
    },
    DeviceProfile {
        device_type: DeviceType::GlucoseMeter,
        service: Some(sig_uuid(0x1808)),
        measurement: Some(sig_uuid(0x2A18)),
        read_timeout: DEFAULT_READ_TIMEOUT,
    },
];

/// Look up the profile for a device class.
#[must_use]
pub fn profile(device_type: DeviceType) -> &'static DeviceProfile {
    PROFILES
        .iter()
        .find(|p| p.device_type == device_type)
        .unwrap_or(&PROFILES[0])
}

/// Identify a device class from advertised service UUIDs.
#[must_use]
pub fn identify_by_service(services: &[Uuid]) -> Option<DeviceType> {
    PROFILES
        .iter()
        .find(|p| p.service.is_some_and(|s| services.contains(&s)))
        .map(|p| p.device_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_uuid_expansion() {
        assert_eq!(
            sig_uuid(0x2A35).to_string(),
            "00002a35-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            sig_uuid(0x1810).to_string(),
            "00001810-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_every_device_type_has_a_profile() {
        for t in DeviceType::ALL {
            assert_eq!(profile(t).device_type, t);
        }
    }

    #[test]
    fn test_identify_by_service() {
        assert_eq!(
            identify_by_service(&[sig_uuid(0x180F), sig_uuid(0x1822)]),
            Some(DeviceType::PulseOximeter)
        );
        assert_eq!(
            identify_by_service(&[sig_uuid(0x1809)]),
            Some(DeviceType::Thermometer)
        );
        assert_eq!(identify_by_service(&[sig_uuid(0x180F)]), None);
        assert_eq!(identify_by_service(&[]), None);
    }

    #[test]
    fn test_blood_pressure_read_timeout() {
        assert_eq!(
            profile(DeviceType::BloodPressure).read_timeout,
            Duration::from_secs(30)
        );
    }
}
