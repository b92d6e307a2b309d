//! OpenAPI component schemas for the collaborator-facing types.
//!
//! The kiosk's web and storage collaborators generate their client types from
//! this document. It carries no paths: the integration layer exposes a Rust
//! API, not HTTP routes.

use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};
use vitalbridge_core::calibration::CalibrationType;
use vitalbridge_core::health::{DeviceHealthReport, HealthSummary};
use vitalbridge_core::{
    BridgeError, CalibrationOptions, CalibrationRecord, CalibrationRequest, CalibrationStatus,
    ConnectionState, DeviceInfo, DeviceReading, DeviceStatus, DeviceType, DriverStats,
    HealthMetrics, HealthReport, HealthStatus, ReadingMetadata,
};

/// Error body handed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "DEVICE_NOT_FOUND",
    "message": "Device not found: 'bp-1'. Run discovery and ensure the device is powered on and within range.",
    "recoverable": false
}))]
pub struct ErrorResponse {
    /// Machine-readable error code.
    pub error: String,
    /// Human-readable error message.
    pub message: String,
    /// Whether retrying later may succeed.
    pub recoverable: bool,
}

impl From<&BridgeError> for ErrorResponse {
    fn from(err: &BridgeError) -> Self {
        Self {
            error: err.error_code().to_string(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        }
    }
}

/// Schema document for vitalbridge.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "vitalbridge",
        version = "0.1.0",
        description = r#"
# vitalbridge

Data model of the kiosk's medical device integration layer.

- **DeviceReading**: one decoded measurement with a plausibility score in [0, 1]
- **CalibrationRecord**: one entry of a device's append-only calibration ledger
- **HealthReport**: per-device health derived from connection state
"#,
        license(name = "MIT")
    ),
    components(schemas(
        DeviceType,
        DeviceInfo,
        DeviceReading,
        ReadingMetadata,
        ConnectionState,
        DriverStats,
        DeviceStatus,
        CalibrationType,
        CalibrationStatus,
        CalibrationOptions,
        CalibrationRequest,
        CalibrationRecord,
        HealthStatus,
        HealthMetrics,
        DeviceHealthReport,
        HealthSummary,
        HealthReport,
        ErrorResponse,
    ))
)]
pub struct SchemaDoc;

/// Returns the schema document as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn schema_json() -> Result<String, serde_json::Error> {
    SchemaDoc::openapi().to_pretty_json()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_lists_core_types() {
        let json: serde_json::Value = serde_json::from_str(&schema_json().unwrap()).unwrap();
        let schemas = json["components"]["schemas"].as_object().unwrap();

        for name in [
            "DeviceReading",
            "CalibrationRecord",
            "HealthReport",
            "DeviceStatus",
            "ErrorResponse",
        ] {
            assert!(schemas.contains_key(name), "missing {name}");
        }
        assert_eq!(json["info"]["title"], "vitalbridge");
    }

    #[test]
    fn test_error_response_from_bridge_error() {
        let err = BridgeError::DeviceNotFound("bp-1".into());
        let body = ErrorResponse::from(&err);
        assert_eq!(body.error, "DEVICE_NOT_FOUND");
        assert!(body.message.contains("bp-1"));
        assert!(!body.recoverable);
    }
}
