//! Shared device and reading types.
//!
//! These are the records handed to collaborators (storage, triage, API layer).
//! Calibration and health types live in their respective modules.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Supported medical device classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Blood pressure monitor (Bluetooth SIG service 0x1810).
    BloodPressure,
    /// Pulse oximeter (service 0x1822).
    PulseOximeter,
    /// Health thermometer (service 0x1809).
    Thermometer,
    /// Weight scale (service 0x181D).
    WeightScale,
    /// Height measurement device.
    HeightMeter,
    /// Glucose meter (service 0x1808).
    GlucoseMeter,
}

impl DeviceType {
    /// All device types, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::BloodPressure,
        Self::PulseOximeter,
        Self::Thermometer,
        Self::WeightScale,
        Self::HeightMeter,
        Self::GlucoseMeter,
    ];

    /// The snake_case name used on the wire and in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BloodPressure => "blood_pressure",
            Self::PulseOximeter => "pulse_oximeter",
            Self::Thermometer => "thermometer",
            Self::WeightScale => "weight_scale",
            Self::HeightMeter => "height_meter",
            Self::GlucoseMeter => "glucose_meter",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown device type '{s}'"))
    }
}

/// Identity and discovery metadata for a physical device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "device_id": "4f1c2a9e-7b0d-4c55-9a3e-2f8f6d1b0c11",
    "name": "OMRON BP7250",
    "manufacturer": "Omron",
    "model": "OMRON BP7250",
    "device_type": "blood_pressure",
    "mac_address": "AA:BB:CC:DD:EE:01",
    "signal_strength": -58,
    "battery_level": null,
    "firmware_version": null,
    "last_seen": "2025-01-15T03:30:00Z",
    "is_paired": false
}))]
pub struct DeviceInfo {
    /// Opaque identifier assigned at discovery time.
    pub device_id: String,

    /// Advertised device name.
    pub name: String,

    /// Manufacturer, inferred from the advertised name when possible.
    pub manufacturer: String,

    /// Model string.
    pub model: String,

    /// Device class.
    pub device_type: DeviceType,

    /// Transport address (MAC on Linux).
    pub mac_address: String,

    /// Signal strength in dBm at the last sighting.
    pub signal_strength: i16,

    /// Battery percentage, if reported.
    pub battery_level: Option<u8>,

    /// Firmware revision, if known.
    pub firmware_version: Option<String>,

    /// Last time the device was seen advertising.
    pub last_seen: DateTime<Utc>,

    /// Whether the device is bonded with this kiosk.
    pub is_paired: bool,
}

/// Diagnostic trace attached to every reading. Never used for clinical decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ReadingMetadata {
    /// The protocol flags byte (byte 0 of the payload).
    pub flags: u8,

    /// Raw payload as lowercase hex.
    pub raw_hex: String,

    /// When the kiosk received the notification.
    pub received_at: DateTime<Utc>,

    /// Unit as sent by the device, when it was converted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_unit: Option<String>,

    /// Value as sent by the device, when it was converted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_value: Option<f64>,
}

/// One decoded measurement event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "device_id": "4f1c2a9e-7b0d-4c55-9a3e-2f8f6d1b0c11",
    "device_type": "blood_pressure",
    "timestamp": "2025-01-15T03:30:00Z",
    "values": {"systolic": 121.0, "diastolic": 79.0, "mean_pressure": 93.0, "pulse_rate": 72.0},
    "unit": "mmHg",
    "quality_score": 0.9,
    "metadata": {"flags": 4, "raw_hex": "0479004f005d004800", "received_at": "2025-01-15T03:30:00Z"}
}))]
pub struct DeviceReading {
    /// Device that produced the reading.
    pub device_id: String,

    /// Device class.
    pub device_type: DeviceType,

    /// Capture time when the protocol supplies one, otherwise receipt time.
    pub timestamp: DateTime<Utc>,

    /// Named scalar fields, e.g. `systolic`, `spo2`, `temperature`.
    pub values: BTreeMap<String, f64>,

    /// Unit label for the values.
    pub unit: String,

    /// Physiological plausibility in `[0, 1]`.
    pub quality_score: f64,

    /// Diagnostic trace.
    pub metadata: ReadingMetadata,
}

impl DeviceReading {
    /// Look up a named value.
    #[must_use]
    pub fn value(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied()
    }

    /// Whether every named field is present.
    #[must_use]
    pub fn has_fields(&self, fields: &[&str]) -> bool {
        fields.iter().all(|f| self.values.contains_key(*f))
    }
}

/// Connection lifecycle of a single driver.
///
/// ```text
/// disconnected -> connecting -> connected -> reading -> connected
///                               connected -> calibrating -> connected
///                               any -> error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link. Initial state; re-enterable.
    #[default]
    Disconnected,
    /// Transport connect in progress.
    Connecting,
    /// Link up and subscribed.
    Connected,
    /// A measurement cycle is in progress.
    Reading,
    /// Device self-test in progress.
    Calibrating,
    /// Last transport operation failed.
    Error,
}

impl ConnectionState {
    /// Health quality derived from the connection state alone.
    #[must_use]
    pub const fn health_quality(self) -> f64 {
        match self {
            Self::Error | Self::Disconnected => 0.0,
            Self::Connected => 0.8,
            Self::Connecting | Self::Reading | Self::Calibrating => 0.6,
        }
    }

    /// Whether the transport link is up.
    #[must_use]
    pub const fn is_link_up(self) -> bool {
        matches!(self, Self::Connected | Self::Reading | Self::Calibrating)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reading => "reading",
            Self::Calibrating => "calibrating",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_round_trips_through_str() {
        for t in DeviceType::ALL {
            assert_eq!(t.to_string().parse::<DeviceType>().unwrap(), t);
        }
        assert!("toaster".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_device_type_serializes_snake_case() {
        let json = serde_json::to_string(&DeviceType::PulseOximeter).unwrap();
        assert_eq!(json, "\"pulse_oximeter\"");
    }

    #[test]
    fn test_connection_state_health_quality() {
        assert!(ConnectionState::Error.health_quality().abs() < f64::EPSILON);
        assert!(ConnectionState::Disconnected.health_quality().abs() < f64::EPSILON);
        assert!((ConnectionState::Connected.health_quality() - 0.8).abs() < f64::EPSILON);
        assert!((ConnectionState::Reading.health_quality() - 0.6).abs() < f64::EPSILON);
        assert!((ConnectionState::Connecting.health_quality() - 0.6).abs() < f64::EPSILON);
        assert!((ConnectionState::Calibrating.health_quality() - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_connection_state_default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert!(!ConnectionState::Connecting.is_link_up());
        assert!(ConnectionState::Reading.is_link_up());
    }

    #[test]
    fn test_reading_field_helpers() {
        let reading = DeviceReading {
            device_id: "dev".into(),
            device_type: DeviceType::Thermometer,
            timestamp: Utc::now(),
            values: BTreeMap::from([("temperature".to_string(), 36.8)]),
            unit: "°C".into(),
            quality_score: 0.9,
            metadata: ReadingMetadata {
                flags: 0,
                raw_hex: String::new(),
                received_at: Utc::now(),
                original_unit: None,
                original_value: None,
            },
        };
        assert_eq!(reading.value("temperature"), Some(36.8));
        assert!(reading.has_fields(&["temperature"]));
        assert!(!reading.has_fields(&["temperature", "humidity"]));
    }
}
