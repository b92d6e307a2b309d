//! Calibration verification against reference values.
//!
//! A calibration run takes a fixed number of readings from a connected
//! device, averages the required fields, and compares the means with the
//! reference values a technician supplies. Every run, pass or fail, appends
//! one [`CalibrationRecord`] to the device's ledger.
//!
//! | Device | Samples | Interval | Minimum | Fields |
//! |--------|---------|----------|---------|--------|
//! | Blood pressure | 5 | 60 s | 3 | systolic, diastolic |
//! | Pulse oximeter | 10 | 12 s | 5 | spo2, pulse_rate |

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::codec::fields;
use crate::driver::DeviceError;
use crate::manager::DeviceManager;
use crate::storage::{LedgerStore, StorageError};
use crate::types::{DeviceReading, DeviceType};

// =============================================================================
// TYPES
// =============================================================================

/// Calibration state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStatus {
    /// No calibration on record.
    Unknown,
    /// Last calibration passed and is current.
    Calibrated,
    /// Last calibration has expired.
    NeedsCalibration,
    /// A calibration run is in progress.
    Calibrating,
    /// Last run could not collect enough samples.
    CalibrationFailed,
    /// Last run measured a deviation beyond tolerance.
    OutOfSpec,
}

/// Who initiated a calibration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationType {
    /// Run by kiosk staff.
    #[default]
    User,
    /// Imported from the manufacturer.
    Factory,
    /// Scheduled by the system.
    Automated,
}

/// One entry in a device's calibration ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "calibration_id": "01946a52-8c4e-7d10-a3f2-5b9c0e1d2f34",
    "device_id": "4f1c2a9e-7b0d-4c55-9a3e-2f8f6d1b0c11",
    "calibration_date": "2025-01-15T03:30:00Z",
    "calibration_type": "user",
    "reference_values": {"systolic": 120.0, "diastolic": 80.0},
    "measured_values": {"systolic": 121.4, "diastolic": 79.2},
    "deviation_values": {"systolic": 1.4, "diastolic": 0.8},
    "status": "calibrated",
    "next_calibration_due": "2026-01-15T03:30:00Z",
    "samples_taken": 5,
    "samples_used": 5,
    "technician_id": "tech-042",
    "notes": null
}))]
pub struct CalibrationRecord {
    /// Time-ordered record id.
    pub calibration_id: Uuid,
    /// Device calibrated.
    pub device_id: String,
    /// When the run finished.
    pub calibration_date: DateTime<Utc>,
    /// Who initiated it.
    pub calibration_type: CalibrationType,
    /// Reference values supplied by the caller.
    pub reference_values: BTreeMap<String, f64>,
    /// Mean of each field over the samples used.
    pub measured_values: BTreeMap<String, f64>,
    /// `|measured - reference|` per field.
    pub deviation_values: BTreeMap<String, f64>,
    /// Outcome.
    pub status: CalibrationStatus,
    /// When the device must be recalibrated, whatever the outcome.
    ///
    /// Imported records without one fall due after the shortest class
    /// interval.
    pub next_calibration_due: Option<DateTime<Utc>>,
    /// Reads attempted.
    #[serde(default)]
    pub samples_taken: u32,
    /// Reads that produced every required field.
    #[serde(default)]
    pub samples_used: u32,
    /// Technician who ran the calibration.
    pub technician_id: Option<String>,
    /// Free-form notes, including the failure reason for failed runs.
    pub notes: Option<String>,
}

/// Optional attributes of a calibration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CalibrationOptions {
    /// Who initiated the run.
    #[serde(default)]
    pub calibration_type: CalibrationType,
    /// Technician running it.
    pub technician_id: Option<String>,
    /// Notes to store on the record.
    pub notes: Option<String>,
}

/// Errors raised before a calibration run starts.
///
/// Once sampling has begun, problems become `calibration_failed` ledger
/// entries instead.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// No driver exists for the device.
    #[error("Device not found: '{device_id}'")]
    DeviceNotFound {
        /// Requested device.
        device_id: String,
    },

    /// The device cannot be calibrated as requested.
    #[error("Device '{device_id}' cannot be calibrated: {reason}")]
    InvalidDevice {
        /// Requested device.
        device_id: String,
        /// Why it was refused.
        reason: String,
    },

    /// There is no calibration procedure for the device class.
    #[error("No calibration procedure for device type '{device_type}'")]
    NoProcedure {
        /// The device class.
        device_type: DeviceType,
    },

    /// A required reference value was not supplied.
    #[error("Missing reference value for '{field}'")]
    MissingReference {
        /// The missing field.
        field: String,
    },

    /// Another run for the same device has not finished.
    #[error("Calibration already in progress for device '{device_id}'")]
    AlreadyInProgress {
        /// The busy device.
        device_id: String,
    },

    /// The ledger could not be loaded or saved.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

// =============================================================================
// PROCEDURE TABLES
// =============================================================================

/// Sampling plan for one device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationProcedure {
    /// Device class.
    pub device_type: DeviceType,
    /// Reads per run.
    pub samples: u32,
    /// Wait between reads.
    pub interval: Duration,
    /// Reads that must succeed.
    pub min_samples: u32,
    /// Fields averaged and compared.
    pub fields: &'static [&'static str],
}

const PROCEDURES: [CalibrationProcedure; 2] = [
    CalibrationProcedure {
        device_type: DeviceType::BloodPressure,
        samples: 5,
        interval: Duration::from_secs(60),
        min_samples: 3,
        fields: &[fields::SYSTOLIC, fields::DIASTOLIC],
    },
    CalibrationProcedure {
        device_type: DeviceType::PulseOximeter,
        samples: 10,
        interval: Duration::from_secs(12),
        min_samples: 5,
        fields: &[fields::SPO2, fields::PULSE_RATE],
    },
];

/// The calibration procedure for a device class, if it has one.
#[must_use]
pub fn procedure(device_type: DeviceType) -> Option<&'static CalibrationProcedure> {
    PROCEDURES.iter().find(|p| p.device_type == device_type)
}

/// How long after a calibration run the device falls due again.
#[must_use]
pub fn calibration_interval(device_type: DeviceType) -> TimeDelta {
    let days = match device_type {
        DeviceType::BloodPressure => 365,
        DeviceType::Thermometer | DeviceType::GlucoseMeter => 90,
        DeviceType::PulseOximeter | DeviceType::WeightScale | DeviceType::HeightMeter => 180,
    };
    TimeDelta::days(days)
}

/// The shortest [`calibration_interval`] of any device class.
fn shortest_calibration_interval() -> TimeDelta {
    DeviceType::ALL
        .into_iter()
        .map(calibration_interval)
        .fold(TimeDelta::MAX, std::cmp::min)
}

/// Maximum tolerated deviation per field. A deviation equal to the threshold passes.
#[must_use]
pub const fn deviation_thresholds(device_type: DeviceType) -> &'static [(&'static str, f64)] {
    match device_type {
        DeviceType::BloodPressure => &[(fields::SYSTOLIC, 3.0), (fields::DIASTOLIC, 3.0)],
        DeviceType::PulseOximeter => &[(fields::SPO2, 2.0), (fields::PULSE_RATE, 3.0)],
        DeviceType::Thermometer => &[(fields::TEMPERATURE, 0.1)],
        DeviceType::WeightScale => &[(fields::WEIGHT, 0.1)],
        DeviceType::HeightMeter | DeviceType::GlucoseMeter => &[],
    }
}

// =============================================================================
// CALIBRATOR
// =============================================================================

/// Runs calibrations and owns the per-device ledgers.
pub struct Calibrator {
    manager: Arc<DeviceManager>,
    store: Option<LedgerStore>,
    ledger: RwLock<HashMap<String, Vec<CalibrationRecord>>>,
    in_progress: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

/// Clears a device's in-progress mark when the run ends, however it ends.
struct RunGuard<'a> {
    in_progress: &'a Mutex<HashSet<String>>,
    device_id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.device_id);
    }
}

impl Calibrator {
    /// Create a calibrator, reloading persisted ledgers from `store`.
    ///
    /// # Errors
    ///
    /// Returns [`CalibrationError::Storage`] if existing ledgers cannot be read.
    pub fn new(
        manager: Arc<DeviceManager>,
        store: Option<LedgerStore>,
    ) -> Result<Self, CalibrationError> {
        let ledger = match &store {
            Some(store) => {
                let loaded = store.load_all()?;
                tracing::info!(devices = loaded.len(), dir = %store.data_dir().display(), "Calibration ledgers loaded");
                loaded
            }
            None => HashMap::new(),
        };

        Ok(Self {
            manager,
            store,
            ledger: RwLock::new(ledger),
            in_progress: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Interrupt every running calibration at its next inter-sample wait.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// Calibrate a blood pressure monitor.
    ///
    /// # Errors
    ///
    /// See [`calibrate`](Self::calibrate).
    pub async fn calibrate_blood_pressure(
        &self,
        device_id: &str,
        reference_systolic: f64,
        reference_diastolic: f64,
    ) -> Result<CalibrationRecord, CalibrationError> {
        let references = BTreeMap::from([
            (fields::SYSTOLIC.to_string(), reference_systolic),
            (fields::DIASTOLIC.to_string(), reference_diastolic),
        ]);
        self.calibrate(
            device_id,
            DeviceType::BloodPressure,
            references,
            CalibrationOptions::default(),
        )
        .await
    }

    /// Calibrate a pulse oximeter.
    ///
    /// # Errors
    ///
    /// See [`calibrate`](Self::calibrate).
    pub async fn calibrate_pulse_oximeter(
        &self,
        device_id: &str,
        reference_spo2: f64,
        reference_pulse_rate: f64,
    ) -> Result<CalibrationRecord, CalibrationError> {
        let references = BTreeMap::from([
            (fields::SPO2.to_string(), reference_spo2),
            (fields::PULSE_RATE.to_string(), reference_pulse_rate),
        ]);
        self.calibrate(
            device_id,
            DeviceType::PulseOximeter,
            references,
            CalibrationOptions::default(),
        )
        .await
    }

    /// Run a calibration of `device_id` as a device of `expected_type`.
    ///
    /// Takes the procedure's readings through the manager, waiting the
    /// procedure interval between reads. Readings missing a required field
    /// are discarded. The resulting record is appended to the ledger and
    /// returned, whatever its status.
    ///
    /// # Errors
    ///
    /// Fails without touching the ledger if the device is unknown, not
    /// connected, of another type, has no procedure, lacks a reference
    /// value, or is already being calibrated.
    pub async fn calibrate(
        &self,
        device_id: &str,
        expected_type: DeviceType,
        references: BTreeMap<String, f64>,
        options: CalibrationOptions,
    ) -> Result<CalibrationRecord, CalibrationError> {
        let driver = self.manager.driver(device_id).await.map_err(|_| {
            CalibrationError::DeviceNotFound {
                device_id: device_id.to_string(),
            }
        })?;
        if driver.device_type() != expected_type {
            return Err(CalibrationError::InvalidDevice {
                device_id: device_id.to_string(),
                reason: format!("device is a {}, not a {expected_type}", driver.device_type()),
            });
        }
        let state = driver.state();
        if !state.is_link_up() {
            return Err(CalibrationError::InvalidDevice {
                device_id: device_id.to_string(),
                reason: format!("device is {state}"),
            });
        }
        drop(driver);

        let procedure = procedure(expected_type).ok_or(CalibrationError::NoProcedure {
            device_type: expected_type,
        })?;
        if let Some(field) = procedure
            .fields
            .iter()
            .find(|field| !references.contains_key(**field))
        {
            return Err(CalibrationError::MissingReference {
                field: (*field).to_string(),
            });
        }

        let _guard = self.begin(device_id)?;
        tracing::info!(
            device_id,
            device_type = %expected_type,
            samples = procedure.samples,
            "Calibration started"
        );

        let (samples, taken, cancelled) = self.collect_samples(device_id, procedure).await;
        let record = build_record(
            device_id,
            expected_type,
            procedure,
            references,
            &samples,
            taken,
            cancelled,
            options,
            Utc::now(),
        );

        tracing::info!(
            device_id,
            status = ?record.status,
            samples_used = record.samples_used,
            deviations = ?record.deviation_values,
            "Calibration finished"
        );
        self.append(record.clone());
        Ok(record)
    }

    fn begin(&self, device_id: &str) -> Result<RunGuard<'_>, CalibrationError> {
        let mut running = self
            .in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !running.insert(device_id.to_string()) {
            return Err(CalibrationError::AlreadyInProgress {
                device_id: device_id.to_string(),
            });
        }
        Ok(RunGuard {
            in_progress: &self.in_progress,
            device_id: device_id.to_string(),
        })
    }

    /// Returns the usable readings, reads attempted, and whether the run was cancelled.
    async fn collect_samples(
        &self,
        device_id: &str,
        procedure: &CalibrationProcedure,
    ) -> (Vec<DeviceReading>, u32, bool) {
        let mut samples = Vec::new();
        let mut taken = 0;

        for i in 0..procedure.samples {
            if i > 0 {
                tokio::select! {
                    () = tokio::time::sleep(procedure.interval) => {}
                    () = self.shutdown.cancelled() => {
                        tracing::warn!(device_id, taken, "Calibration cancelled");
                        return (samples, taken, true);
                    }
                }
            }

            taken += 1;
            match self.manager.read(device_id).await {
                Ok(Some(reading)) if reading.has_fields(procedure.fields) => samples.push(reading),
                Ok(Some(_)) => {
                    tracing::debug!(device_id, sample = taken, "Discarding reading without required fields");
                }
                Ok(None) => tracing::debug!(device_id, sample = taken, "No reading for sample"),
                Err(DeviceError::NotFound { .. }) => {
                    tracing::warn!(device_id, "Device removed during calibration");
                    break;
                }
                Err(e) => tracing::warn!(device_id, sample = taken, error = %e, "Sample read failed"),
            }
        }
        (samples, taken, false)
    }

    /// Import a record into the ledger, e.g. a factory calibration certificate.
    ///
    /// # Errors
    ///
    /// Returns [`CalibrationError::Storage`] if the ledger cannot be persisted.
    pub fn record(&self, record: CalibrationRecord) -> Result<(), CalibrationError> {
        self.push(record)
    }

    fn append(&self, record: CalibrationRecord) {
        let device_id = record.device_id.clone();
        if let Err(e) = self.push(record) {
            tracing::error!(device_id, error = %e, "Failed to persist calibration ledger");
        }
    }

    /// Append to the in-memory ledger and persist it. The ledger lock is held
    /// across the write so files land in append order.
    fn push(&self, record: CalibrationRecord) -> Result<(), CalibrationError> {
        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        let device_id = record.device_id.clone();
        let records = ledger.entry(device_id.clone()).or_default();
        records.push(record);
        self.persist(&device_id, records)
    }

    fn persist(&self, device_id: &str, records: &[CalibrationRecord]) -> Result<(), CalibrationError> {
        if let Some(store) = &self.store {
            store.save_ledger(device_id, records)?;
        }
        Ok(())
    }

    /// Every record for a device, oldest first.
    #[must_use]
    pub fn history(&self, device_id: &str) -> Vec<CalibrationRecord> {
        self.ledger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Current calibration status of a device.
    #[must_use]
    pub fn check_calibration_status(&self, device_id: &str) -> CalibrationStatus {
        self.check_calibration_status_at(device_id, Utc::now())
    }

    /// Calibration status of a device as of `now`.
    #[must_use]
    pub fn check_calibration_status_at(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> CalibrationStatus {
        if self
            .in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(device_id)
        {
            return CalibrationStatus::Calibrating;
        }

        let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
        let Some(latest) = ledger
            .get(device_id)
            .and_then(|records| records.iter().max_by_key(|r| r.calibration_date))
        else {
            return CalibrationStatus::Unknown;
        };

        let due = latest
            .next_calibration_due
            .unwrap_or_else(|| latest.calibration_date + shortest_calibration_interval());
        if now > due {
            CalibrationStatus::NeedsCalibration
        } else {
            latest.status
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    device_id: &str,
    device_type: DeviceType,
    procedure: &CalibrationProcedure,
    reference_values: BTreeMap<String, f64>,
    samples: &[DeviceReading],
    samples_taken: u32,
    cancelled: bool,
    options: CalibrationOptions,
    calibration_date: DateTime<Utc>,
) -> CalibrationRecord {
    let samples_used = u32::try_from(samples.len()).unwrap_or(u32::MAX);
    let mut record = CalibrationRecord {
        calibration_id: Uuid::now_v7(),
        device_id: device_id.to_string(),
        calibration_date,
        calibration_type: options.calibration_type,
        reference_values,
        measured_values: BTreeMap::new(),
        deviation_values: BTreeMap::new(),
        status: CalibrationStatus::CalibrationFailed,
        next_calibration_due: Some(calibration_date + calibration_interval(device_type)),
        samples_taken,
        samples_used,
        technician_id: options.technician_id,
        notes: options.notes,
    };

    let failure = if cancelled {
        Some(format!(
            "Calibration cancelled after {samples_taken} of {} samples",
            procedure.samples
        ))
    } else if samples_used < procedure.min_samples {
        Some(format!(
            "Insufficient valid samples: {samples_used} of {samples_taken}, need {}",
            procedure.min_samples
        ))
    } else {
        None
    };
    if let Some(failure) = failure {
        record.notes = Some(match record.notes.take() {
            Some(notes) => format!("{notes}; {failure}"),
            None => failure,
        });
        return record;
    }

    for field in procedure.fields {
        let values: Vec<f64> = samples.iter().filter_map(|r| r.value(field)).collect();
        #[allow(clippy::cast_precision_loss)]
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        record.measured_values.insert((*field).to_string(), mean);
        if let Some(reference) = record.reference_values.get(*field) {
            record
                .deviation_values
                .insert((*field).to_string(), (mean - reference).abs());
        }
    }

    let out_of_spec = deviation_thresholds(device_type).iter().any(|(field, limit)| {
        record
            .deviation_values
            .get(*field)
            .is_some_and(|deviation| deviation > limit)
    });
    record.status = if out_of_spec {
        CalibrationStatus::OutOfSpec
    } else {
        CalibrationStatus::Calibrated
    };
    record
}
