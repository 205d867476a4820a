//! Pre-broadcast snapshot validation.
//!
//! Checks run on the serialized form, the same JSON object every
//! subscriber receives.

use serde_json::Value;
use std::time::Duration;

use super::snapshot::Snapshot;
use crate::clock::age_of;
use crate::error::{RelayError, Result};

/// Top-level fields a broadcast snapshot must carry
pub const REQUIRED_FIELDS: [&str; 4] = ["timestamp", "position", "state", "heartbeat"];

/// Validate a serialized snapshot at time `now` (Unix seconds)
///
/// # Errors
///
/// Returns [`RelayError::ValidationFailed`] if the value is not an object,
/// lacks a required field, has a non-numeric or too old timestamp, or has a
/// null `heartbeat.last_heartbeat`.
pub fn validate_value(value: &Value, now: f64, freshness: Duration) -> Result<()> {
    let object = value
        .as_object()
        .ok_or_else(|| RelayError::ValidationFailed("snapshot is not an object".to_string()))?;

    if let Some(missing) = REQUIRED_FIELDS.iter().find(|f| !object.contains_key(**f)) {
        return Err(RelayError::ValidationFailed(format!("missing field {}", missing)));
    }

    let timestamp = object["timestamp"]
        .as_f64()
        .ok_or_else(|| RelayError::ValidationFailed("timestamp is not numeric".to_string()))?;
    let age = age_of(timestamp, now);
    if age > freshness.as_secs_f64() {
        return Err(RelayError::ValidationFailed(format!("snapshot is {:.1}s old", age)));
    }

    let heartbeat = object["heartbeat"].get("last_heartbeat").unwrap_or(&Value::Null);
    if heartbeat.is_null() {
        return Err(RelayError::ValidationFailed("heartbeat missing".to_string()));
    }

    Ok(())
}

/// Validate a typed snapshot
pub fn validate(snapshot: &Snapshot, now: f64, freshness: Duration) -> Result<()> {
    validate_value(&serde_json::to_value(snapshot)?, now, freshness)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FRESHNESS: Duration = Duration::from_secs(10);

    #[test]
    fn test_placeholder_passes() {
        let snapshot = Snapshot::placeholder(1000.0);
        assert!(validate(&snapshot, 1000.5, FRESHNESS).is_ok());
    }

    #[test]
    fn test_revalidation_is_idempotent() {
        let snapshot = Snapshot::placeholder(1000.0);
        let now = 1001.0;
        assert!(validate(&snapshot, now, FRESHNESS).is_ok());
        assert!(validate(&snapshot, now, FRESHNESS).is_ok());
    }

    #[test]
    fn test_defaults_fail_on_missing_heartbeat() {
        let snapshot = Snapshot::defaults(1000.0);
        match validate(&snapshot, 1000.0, FRESHNESS) {
            Err(RelayError::ValidationFailed(reason)) => assert!(reason.contains("heartbeat")),
            other => panic!("Expected ValidationFailed, got: {:?}", other),
        }
    }

    #[test]
    fn test_stale_snapshot_fails() {
        let snapshot = Snapshot::placeholder(1000.0);
        assert!(validate(&snapshot, 1010.0, FRESHNESS).is_ok());
        assert!(validate(&snapshot, 1010.5, FRESHNESS).is_err());
    }

    #[test]
    fn test_missing_required_field_fails() {
        for field in REQUIRED_FIELDS {
            let mut value = serde_json::to_value(Snapshot::placeholder(1000.0)).unwrap();
            value.as_object_mut().unwrap().remove(field);
            assert!(validate_value(&value, 1000.0, FRESHNESS).is_err(), "removed {}", field);
        }
    }

    #[test]
    fn test_non_object_fails() {
        assert!(validate_value(&json!([1, 2, 3]), 0.0, FRESHNESS).is_err());
        assert!(validate_value(&Value::Null, 0.0, FRESHNESS).is_err());
    }

    #[test]
    fn test_non_numeric_timestamp_fails() {
        let value = json!({
            "timestamp": "now",
            "position": {},
            "state": {},
            "heartbeat": {"last_heartbeat": 1.0},
        });
        assert!(validate_value(&value, 0.0, FRESHNESS).is_err());
    }

    #[test]
    fn test_minimal_object_passes() {
        let value = json!({
            "timestamp": 99.0,
            "position": {},
            "state": {},
            "heartbeat": {"last_heartbeat": 98.0},
        });
        assert!(validate_value(&value, 100.0, FRESHNESS).is_ok());
    }
}
