//! Reading sink that hands readings to the structured log.
//!
//! Downstream collectors (journald, the JSON log file) pick readings up from
//! the `vitalbridge::readings` target.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use vitalbridge_core::{DeviceReading, ReadingSink, SinkError};

/// Logs every reading as one JSON-encoded event.
#[derive(Debug, Default)]
pub struct TracingSink {
    stored: AtomicU64,
}

impl TracingSink {
    /// Create a sink.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stored: AtomicU64::new(0),
        }
    }

    /// Readings logged so far.
    #[must_use]
    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReadingSink for TracingSink {
    async fn store(&self, reading: DeviceReading) -> Result<(), SinkError> {
        let payload =
            serde_json::to_string(&reading).map_err(|e| SinkError::Rejected(e.to_string()))?;
        tracing::info!(
            target: "vitalbridge::readings",
            device_id = %reading.device_id,
            device_type = %reading.device_type,
            quality = reading.quality_score,
            reading = %payload,
            "Reading received"
        );
        self.stored.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use tokio_test::assert_ok;
    use vitalbridge_core::{DeviceType, ReadingMetadata};

    use super::*;

    fn reading() -> DeviceReading {
        let now = Utc::now();
        DeviceReading {
            device_id: "bp-1".into(),
            device_type: DeviceType::BloodPressure,
            timestamp: now,
            values: BTreeMap::from([("systolic".to_string(), 120.0)]),
            unit: "mmHg".into(),
            quality_score: 0.9,
            metadata: ReadingMetadata {
                flags: 0,
                raw_hex: "00780050005d00".into(),
                received_at: now,
                original_unit: None,
                original_value: None,
            },
        }
    }

    #[tokio::test]
    async fn test_store_counts_readings() {
        let sink = TracingSink::new();
        assert_ok!(sink.store(reading()).await);
        assert_ok!(sink.store(reading()).await);
        assert_eq!(sink.stored(), 2);
    }
}
