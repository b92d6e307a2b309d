//! Destination for decoded readings.
//!
//! The integration layer does not persist readings itself. The manager hands
//! every decoded reading to a [`ReadingSink`] supplied by the embedding
//! application (database writer, triage engine, message bus, ...).

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::DeviceReading;

/// Errors raised by a sink.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// The receiving side has gone away.
    #[error("Reading sink is closed")]
    Closed,

    /// The sink refused the reading.
    #[error("Reading rejected by sink: {0}")]
    Rejected(String),
}

/// Receiver of processed readings.
#[async_trait]
pub trait ReadingSink: Send + Sync {
    /// Store one reading.
    async fn store(&self, reading: DeviceReading) -> Result<(), SinkError>;
}

/// Sink forwarding readings into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DeviceReading>,
}

impl ChannelSink {
    /// Create a sink and the receiver it feeds.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeviceReading>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ReadingSink for ChannelSink {
    async fn store(&self, reading: DeviceReading) -> Result<(), SinkError> {
        self.tx.send(reading).map_err(|_| SinkError::Closed)
    }
}

/// Sink that drops every reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl ReadingSink for NullSink {
    async fn store(&self, _reading: DeviceReading) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::types::{DeviceType, ReadingMetadata};

    fn reading() -> DeviceReading {
        DeviceReading {
            device_id: "thermo".into(),
            device_type: DeviceType::Thermometer,
            timestamp: Utc::now(),
            values: BTreeMap::from([("temperature".to_string(), 36.9)]),
            unit: "°C".into(),
            quality_score: 0.9,
            metadata: ReadingMetadata {
                flags: 0,
                raw_hex: "00".into(),
                received_at: Utc::now(),
                original_unit: None,
                original_value: None,
            },
        }
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.store(reading()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().device_id, "thermo");
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        assert!(matches!(sink.store(reading()).await, Err(SinkError::Closed)));
    }
}
