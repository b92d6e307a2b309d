//! Measurement payload decoding.
//!
//! Each supported device class has a pure decoder that turns one GATT
//! notification payload into a [`DeviceReading`] with normalized units and a
//! plausibility score. Out-of-range values are never rejected here; they only
//! lower `quality_score` so clinicians can still review the raw value.
//!
//! | Class | Layout |
//! |-------|--------|
//! | Blood pressure | flags, sys u16, dia u16, map u16, [timestamp 7B], [pulse u16] |
//! | Pulse oximetry | flags, SpO2×100 u16, pulse u16 |
//! | Thermometer | flags, f32 temperature |
//!
//! All multi-byte fields are little-endian.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::types::{DeviceReading, DeviceType, ReadingMetadata};

/// Value names used in [`DeviceReading::values`].
pub mod fields {
    /// Systolic pressure.
    pub const SYSTOLIC: &str = "systolic";
    /// Diastolic pressure.
    pub const DIASTOLIC: &str = "diastolic";
    /// Mean arterial pressure.
    pub const MEAN_PRESSURE: &str = "mean_pressure";
    /// Pulse rate in beats per minute.
    pub const PULSE_RATE: &str = "pulse_rate";
    /// Oxygen saturation in percent.
    pub const SPO2: &str = "spo2";
    /// Body temperature in degrees Celsius.
    pub const TEMPERATURE: &str = "temperature";
    /// Body weight in kilograms.
    pub const WEIGHT: &str = "weight";
}

const BP_FLAG_KPA: u8 = 0x01;
const BP_FLAG_TIMESTAMP: u8 = 0x02;
const BP_FLAG_PULSE_RATE: u8 = 0x04;
const TEMP_FLAG_FAHRENHEIT: u8 = 0x01;

const BP_FIXED_LEN: usize = 7;
const TIMESTAMP_LEN: usize = 7;
const PULSE_RATE_LEN: usize = 2;
const PLX_LEN: usize = 5;
const TEMP_LEN: usize = 5;

/// Why a payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The payload is shorter than its flags declare.
    #[error("{device_type} payload too short: need {expected} bytes, got {actual}")]
    TooShort {
        /// Device class being decoded.
        device_type: DeviceType,
        /// Bytes required by the declared fields.
        expected: usize,
        /// Bytes received.
        actual: usize,
    },

    /// No decoder exists for this device class.
    #[error("no measurement decoder for {0}")]
    UnsupportedDeviceType(DeviceType),

    /// A floating-point field held NaN or infinity.
    #[error("{device_type} payload carries a non-finite value")]
    NonFiniteValue {
        /// Device class being decoded.
        device_type: DeviceType,
    },
}

/// Whether a decoder exists for this device class.
#[must_use]
pub const fn supports(device_type: DeviceType) -> bool {
    matches!(
        device_type,
        DeviceType::BloodPressure | DeviceType::PulseOximeter | DeviceType::Thermometer
    )
}

/// Decode one notification payload received at `received_at`.
///
/// # Errors
///
/// Returns [`DecodeError`] when the payload is malformed or the device class
/// has no decoder.
pub fn decode(
    device_type: DeviceType,
    device_id: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<DeviceReading, DecodeError> {
    let decoded = match device_type {
        DeviceType::BloodPressure => decode_blood_pressure(payload, received_at)?,
        DeviceType::PulseOximeter => decode_pulse_oximetry(payload)?,
        DeviceType::Thermometer => decode_temperature(payload)?,
        other => return Err(DecodeError::UnsupportedDeviceType(other)),
    };

    Ok(DeviceReading {
        device_id: device_id.to_string(),
        device_type,
        timestamp: decoded.captured_at.unwrap_or(received_at),
        values: decoded.values,
        unit: decoded.unit.to_string(),
        quality_score: decoded.quality_score,
        metadata: ReadingMetadata {
            flags: payload[0],
            raw_hex: to_hex(payload),
            received_at,
            original_unit: decoded.original.map(|(unit, _)| unit.to_string()),
            original_value: decoded.original.map(|(_, value)| value),
        },
    })
}

struct Decoded {
    values: BTreeMap<String, f64>,
    unit: &'static str,
    quality_score: f64,
    captured_at: Option<DateTime<Utc>>,
    original: Option<(&'static str, f64)>,
}

fn decode_blood_pressure(
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Decoded, DecodeError> {
    let device_type = DeviceType::BloodPressure;
    require_len(device_type, payload, BP_FIXED_LEN)?;

    let flags = payload[0];
    let has_timestamp = flags & BP_FLAG_TIMESTAMP != 0;
    let has_pulse = flags & BP_FLAG_PULSE_RATE != 0;

    let mut expected = BP_FIXED_LEN;
    if has_timestamp {
        expected += TIMESTAMP_LEN;
    }
    if has_pulse {
        expected += PULSE_RATE_LEN;
    }
    require_len(device_type, payload, expected)?;

    let (unit, scale) = if flags & BP_FLAG_KPA != 0 {
        ("kPa", 1000.0)
    } else {
        ("mmHg", 1.0)
    };
    let systolic = f64::from(read_u16(payload, 1)) / scale;
    let diastolic = f64::from(read_u16(payload, 3)) / scale;
    let mean_pressure = f64::from(read_u16(payload, 5)) / scale;

    let mut offset = BP_FIXED_LEN;
    let mut captured_at = None;
    if has_timestamp {
        captured_at = parse_date_time(&payload[offset..offset + TIMESTAMP_LEN]);
        if captured_at.is_none() {
            tracing::debug!(%received_at, "BP timestamp unset or invalid, using receipt time");
        }
        offset += TIMESTAMP_LEN;
    }

    let mut values = BTreeMap::from([
        (fields::SYSTOLIC.to_string(), systolic),
        (fields::DIASTOLIC.to_string(), diastolic),
        (fields::MEAN_PRESSURE.to_string(), mean_pressure),
    ]);
    if has_pulse {
        values.insert(
            fields::PULSE_RATE.to_string(),
            f64::from(read_u16(payload, offset)),
        );
    }

    Ok(Decoded {
        values,
        unit,
        quality_score: blood_pressure_quality(systolic, diastolic),
        captured_at,
        original: None,
    })
}

fn decode_pulse_oximetry(payload: &[u8]) -> Result<Decoded, DecodeError> {
    require_len(DeviceType::PulseOximeter, payload, PLX_LEN)?;

    let spo2 = f64::from(read_u16(payload, 1)) / 100.0;
    let pulse_rate = f64::from(read_u16(payload, 3));

    Ok(Decoded {
        values: BTreeMap::from([
            (fields::SPO2.to_string(), spo2),
            (fields::PULSE_RATE.to_string(), pulse_rate),
        ]),
        unit: "%",
        quality_score: pulse_oximetry_quality(spo2, pulse_rate),
        captured_at: None,
        original: None,
    })
}

fn decode_temperature(payload: &[u8]) -> Result<Decoded, DecodeError> {
    let device_type = DeviceType::Thermometer;
    require_len(device_type, payload, TEMP_LEN)?;

    let raw = f32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    if !raw.is_finite() {
        return Err(DecodeError::NonFiniteValue { device_type });
    }
    let raw = f64::from(raw);

    let fahrenheit = payload[0] & TEMP_FLAG_FAHRENHEIT != 0;
    let (celsius, original) = if fahrenheit {
        (fahrenheit_to_celsius(raw), Some(("°F", raw)))
    } else {
        (raw, None)
    };

    Ok(Decoded {
        values: BTreeMap::from([(fields::TEMPERATURE.to_string(), celsius)]),
        unit: "°C",
        quality_score: temperature_quality(celsius),
        captured_at: None,
        original,
    })
}

/// Plausibility of a blood pressure pair.
#[must_use]
pub fn blood_pressure_quality(systolic: f64, diastolic: f64) -> f64 {
    if !(50.0..=250.0).contains(&systolic) || !(30.0..=150.0).contains(&diastolic) {
        return 0.3;
    }
    if systolic <= diastolic {
        return 0.4;
    }
    let pulse_pressure = systolic - diastolic;
    if !(20.0..=100.0).contains(&pulse_pressure) {
        return 0.6;
    }
    0.9
}

/// Plausibility of a pulse oximetry pair.
#[must_use]
pub fn pulse_oximetry_quality(spo2: f64, pulse_rate: f64) -> f64 {
    if !(70.0..=100.0).contains(&spo2) || !(30.0..=200.0).contains(&pulse_rate) {
        return 0.3;
    }
    // Valid but clinically concerning.
    if spo2 < 85.0 {
        return 0.8;
    }
    0.9
}

/// Plausibility of a body temperature in Celsius.
#[must_use]
pub fn temperature_quality(celsius: f64) -> f64 {
    if (32.0..=45.0).contains(&celsius) {
        0.9
    } else {
        0.2
    }
}

/// Convert Fahrenheit to Celsius.
#[must_use]
pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

fn require_len(device_type: DeviceType, payload: &[u8], expected: usize) -> Result<(), DecodeError> {
    if payload.len() < expected {
        return Err(DecodeError::TooShort {
            device_type,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn read_u16(payload: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([payload[offset], payload[offset + 1]])
}

/// IEEE-11073 date-time: year u16, month, day, hours, minutes, seconds.
fn parse_date_time(bytes: &[u8]) -> Option<DateTime<Utc>> {
    let year = i32::from(read_u16(bytes, 0));
    Utc.with_ymd_and_hms(
        year,
        u32::from(bytes[2]),
        u32::from(bytes[3]),
        u32::from(bytes[4]),
        u32::from(bytes[5]),
        u32::from(bytes[6]),
    )
    .single()
}

fn to_hex(payload: &[u8]) -> String {
    payload
        .iter()
        .fold(String::with_capacity(payload.len() * 2), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bp_payload(flags: u8, sys: u16, dia: u16, map: u16, tail: &[u8]) -> Vec<u8> {
        let mut p = vec![flags];
        p.extend_from_slice(&sys.to_le_bytes());
        p.extend_from_slice(&dia.to_le_bytes());
        p.extend_from_slice(&map.to_le_bytes());
        p.extend_from_slice(tail);
        p
    }

    fn approx(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_blood_pressure_mmhg_with_pulse() {
        let payload = bp_payload(BP_FLAG_PULSE_RATE, 121, 79, 93, &72u16.to_le_bytes());
        let now = Utc::now();
        let reading = decode(DeviceType::BloodPressure, "bp-1", &payload, now).unwrap();

        assert_eq!(reading.unit, "mmHg");
        assert_eq!(reading.value(fields::SYSTOLIC), Some(121.0));
        assert_eq!(reading.value(fields::DIASTOLIC), Some(79.0));
        assert_eq!(reading.value(fields::MEAN_PRESSURE), Some(93.0));
        assert_eq!(reading.value(fields::PULSE_RATE), Some(72.0));
        assert_eq!(reading.timestamp, now);
        assert_eq!(reading.metadata.flags, BP_FLAG_PULSE_RATE);
        assert_eq!(reading.metadata.raw_hex, "0479004f005d004800");
        assert!(approx(reading.quality_score, 0.9, 1e-9));
    }

    #[test]
    fn test_blood_pressure_valid_payloads_score_high() {
        for (sys, dia) in [(120, 80), (100, 70), (150, 95), (181, 82), (90, 70)] {
            let payload = bp_payload(0, sys, dia, (sys + 2 * dia) / 3, &[]);
            let reading = decode(DeviceType::BloodPressure, "bp", &payload, Utc::now()).unwrap();
            assert!(
                approx(reading.quality_score, 0.9, 1e-9),
                "{sys}/{dia} scored {}",
                reading.quality_score
            );
        }
    }

    #[test]
    fn test_blood_pressure_kpa_is_divided_by_1000() {
        let payload = bp_payload(BP_FLAG_KPA, 16000, 10667, 12445, &[]);
        let reading = decode(DeviceType::BloodPressure, "bp", &payload, Utc::now()).unwrap();

        assert_eq!(reading.unit, "kPa");
        assert!(approx(reading.value(fields::SYSTOLIC).unwrap(), 16.0, 1e-9));
        assert!(approx(reading.value(fields::DIASTOLIC).unwrap(), 10.667, 1e-9));
        assert!(!reading.values.contains_key(fields::PULSE_RATE));
    }

    #[test]
    fn test_blood_pressure_device_timestamp_is_capture_time() {
        let mut tail = Vec::new();
        tail.extend_from_slice(&2025u16.to_le_bytes());
        tail.extend_from_slice(&[1, 15, 3, 30, 0]);
        tail.extend_from_slice(&66u16.to_le_bytes());
        let payload = bp_payload(BP_FLAG_TIMESTAMP | BP_FLAG_PULSE_RATE, 118, 76, 90, &tail);

        let received = Utc::now();
        let reading = decode(DeviceType::BloodPressure, "bp", &payload, received).unwrap();

        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2025, 1, 15, 3, 30, 0).unwrap()
        );
        assert_eq!(reading.metadata.received_at, received);
        // Pulse rate follows the timestamp bytes.
        assert_eq!(reading.value(fields::PULSE_RATE), Some(66.0));
    }

    #[test]
    fn test_blood_pressure_unset_timestamp_falls_back_to_receipt() {
        let payload = bp_payload(BP_FLAG_TIMESTAMP, 118, 76, 90, &[0; 7]);
        let received = Utc::now();
        let reading = decode(DeviceType::BloodPressure, "bp", &payload, received).unwrap();
        assert_eq!(reading.timestamp, received);
    }

    #[test]
    fn test_blood_pressure_declared_fields_must_be_present() {
        let short = [0u8, 0x78, 0x00, 0x50];
        assert_eq!(
            decode(DeviceType::BloodPressure, "bp", &short, Utc::now()).unwrap_err(),
            DecodeError::TooShort {
                device_type: DeviceType::BloodPressure,
                expected: 7,
                actual: 4
            }
        );

        // Pulse flag set but no pulse bytes.
        let payload = bp_payload(BP_FLAG_PULSE_RATE, 120, 80, 93, &[]);
        assert!(matches!(
            decode(DeviceType::BloodPressure, "bp", &payload, Utc::now()),
            Err(DecodeError::TooShort { expected: 9, .. })
        ));

        // Timestamp flag set with a truncated timestamp.
        let payload = bp_payload(BP_FLAG_TIMESTAMP, 120, 80, 93, &[0xe9, 0x07, 1]);
        assert!(matches!(
            decode(DeviceType::BloodPressure, "bp", &payload, Utc::now()),
            Err(DecodeError::TooShort { expected: 14, .. })
        ));

        assert!(decode(DeviceType::BloodPressure, "bp", &[], Utc::now()).is_err());
    }

    #[test]
    fn test_blood_pressure_quality_bands() {
        assert!(approx(blood_pressure_quality(260.0, 80.0), 0.3, 1e-9));
        assert!(approx(blood_pressure_quality(120.0, 20.0), 0.3, 1e-9));
        assert!(approx(blood_pressure_quality(80.0, 90.0), 0.4, 1e-9));
        assert!(approx(blood_pressure_quality(80.0, 80.0), 0.4, 1e-9));
        assert!(approx(blood_pressure_quality(95.0, 85.0), 0.6, 1e-9));
        assert!(approx(blood_pressure_quality(240.0, 100.0), 0.6, 1e-9));
        assert!(approx(blood_pressure_quality(100.0, 80.0), 0.9, 1e-9));
        assert!(approx(blood_pressure_quality(180.0, 80.0), 0.9, 1e-9));
    }

    #[test]
    fn test_pulse_oximetry_decode() {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&9750u16.to_le_bytes());
        payload.extend_from_slice(&68u16.to_le_bytes());

        let reading = decode(DeviceType::PulseOximeter, "plx", &payload, Utc::now()).unwrap();
        assert!(approx(reading.value(fields::SPO2).unwrap(), 97.5, 1e-9));
        assert_eq!(reading.value(fields::PULSE_RATE), Some(68.0));
        assert_eq!(reading.unit, "%");
        assert!(approx(reading.quality_score, 0.9, 1e-9));
    }

    #[test]
    fn test_pulse_oximetry_quality_bands() {
        assert!(approx(pulse_oximetry_quality(65.0, 80.0), 0.3, 1e-9));
        assert!(approx(pulse_oximetry_quality(97.0, 220.0), 0.3, 1e-9));
        assert!(approx(pulse_oximetry_quality(82.0, 110.0), 0.8, 1e-9));
        assert!(approx(pulse_oximetry_quality(85.0, 110.0), 0.9, 1e-9));
        assert!(approx(pulse_oximetry_quality(99.0, 60.0), 0.9, 1e-9));
    }

    #[test]
    fn test_pulse_oximetry_too_short() {
        let err = decode(DeviceType::PulseOximeter, "plx", &[0, 0x10, 0x26, 0x44], Utc::now())
            .unwrap_err();
        assert!(matches!(err, DecodeError::TooShort { expected: 5, actual: 4, .. }));
    }

    #[test]
    fn test_thermometer_fahrenheit_is_normalized_to_celsius() {
        let mut payload = vec![TEMP_FLAG_FAHRENHEIT];
        payload.extend_from_slice(&98.6f32.to_le_bytes());

        let reading = decode(DeviceType::Thermometer, "thermo", &payload, Utc::now()).unwrap();
        assert!(approx(reading.value(fields::TEMPERATURE).unwrap(), 37.0, 0.05));
        assert_eq!(reading.unit, "°C");
        assert_eq!(reading.metadata.original_unit.as_deref(), Some("°F"));
        assert!(approx(reading.metadata.original_value.unwrap(), 98.6, 1e-4));
        assert!(approx(reading.quality_score, 0.9, 1e-9));
    }

    #[test]
    fn test_thermometer_celsius_passthrough() {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&36.6f32.to_le_bytes());

        let reading = decode(DeviceType::Thermometer, "thermo", &payload, Utc::now()).unwrap();
        assert!(approx(reading.value(fields::TEMPERATURE).unwrap(), 36.6, 1e-5));
        assert!(reading.metadata.original_unit.is_none());
    }

    #[test]
    fn test_thermometer_out_of_range_is_kept_with_low_quality() {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&25.0f32.to_le_bytes());

        let reading = decode(DeviceType::Thermometer, "thermo", &payload, Utc::now()).unwrap();
        assert!(approx(reading.value(fields::TEMPERATURE).unwrap(), 25.0, 1e-9));
        assert!(approx(reading.quality_score, 0.2, 1e-9));
    }

    #[test]
    fn test_thermometer_rejects_nan() {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&f32::NAN.to_le_bytes());
        assert_eq!(
            decode(DeviceType::Thermometer, "thermo", &payload, Utc::now()).unwrap_err(),
            DecodeError::NonFiniteValue {
                device_type: DeviceType::Thermometer
            }
        );
    }

    #[test]
    fn test_unsupported_device_type() {
        assert!(!supports(DeviceType::WeightScale));
        assert_eq!(
            decode(DeviceType::WeightScale, "scale", &[0, 1, 2], Utc::now()).unwrap_err(),
            DecodeError::UnsupportedDeviceType(DeviceType::WeightScale)
        );
    }
}
