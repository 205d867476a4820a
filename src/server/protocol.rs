//! Subscriber control protocol.
//!
//! One JSON object per text frame. Requests carry an `action` field:
//!
//! | action | fields | response |
//! |--------|--------|----------|
//! | `connect` | `address` (or `connection_string`), `baud`, `timeout_s` | `{"status":"connected"}` / `{"status":"failed"}` |
//! | `disconnect` | | `{"status":"disconnected"}` |
//! | `get_telemetry` | | snapshot |
//! | `health_check` | | health report |
//!
//! Anything else gets `{"error":"unknown action"}`; a frame that is not a
//! well-formed request gets `{"error":"invalid input"}`.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{RelayError, Result};
use crate::source::ConnectParams;

pub const INVALID_INPUT: &str = "invalid input";
pub const UNKNOWN_ACTION: &str = "unknown action";
pub const INTERNAL_ERROR: &str = "internal server error";

/// Baud rate assumed when a connect request does not name one
pub const DEFAULT_BAUD: u32 = 57600;

fn default_baud() -> Option<u32> {
    Some(DEFAULT_BAUD)
}

/// Parameters of a `connect` request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectRequest {
    #[serde(alias = "connection_string")]
    pub address: String,

    #[serde(default = "default_baud")]
    pub baud: Option<u32>,

    #[serde(default)]
    pub timeout_s: Option<f64>,
}

impl ConnectRequest {
    pub fn params(&self) -> ConnectParams {
        ConnectParams { baud: self.baud, timeout_s: self.timeout_s }
    }
}

/// A recognised control action
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Connect(ConnectRequest),
    Disconnect,
    GetTelemetry,
    HealthCheck,
}

/// Outcome of parsing one request frame
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Action(Action),
    /// Well-formed request naming an action this server does not know
    Unknown(String),
}

/// Parse a request frame
///
/// # Errors
///
/// Returns [`RelayError::Protocol`] if the text is not a JSON object with a
/// string `action`, or a known action lacks its required fields.
pub fn parse_request(text: &str) -> Result<Request> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RelayError::Protocol(format!("not JSON: {}", e)))?;
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::Protocol("missing action".to_string()))?;

    let action = match action {
        "connect" => {
            let request = ConnectRequest::deserialize(&value)
                .map_err(|e| RelayError::Protocol(format!("bad connect request: {}", e)))?;
            Action::Connect(request)
        }
        "disconnect" => Action::Disconnect,
        "get_telemetry" => Action::GetTelemetry,
        "health_check" => Action::HealthCheck,
        other => return Ok(Request::Unknown(other.to_string())),
    };
    Ok(Request::Action(action))
}

pub fn error_response(message: &str) -> String {
    json!({ "error": message }).to_string()
}

pub fn status_response(status: &str) -> String {
    json!({ "status": status }).to_string()
}

/// Notice sent to every subscriber before the server closes its connection
pub fn shutdown_notice() -> String {
    json!({ "type": "server_shutdown", "message": "Server is shutting down" }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_actions() {
        assert_eq!(
            parse_request(r#"{"action":"disconnect"}"#).unwrap(),
            Request::Action(Action::Disconnect)
        );
        assert_eq!(
            parse_request(r#"{"action":"get_telemetry"}"#).unwrap(),
            Request::Action(Action::GetTelemetry)
        );
        assert_eq!(
            parse_request(r#"{"action":"health_check","extra":1}"#).unwrap(),
            Request::Action(Action::HealthCheck)
        );
    }

    #[test]
    fn test_parse_connect_with_address() {
        let request = parse_request(r#"{"action":"connect","address":"udp:127.0.0.1:14550","timeout_s":5}"#).unwrap();
        match request {
            Request::Action(Action::Connect(connect)) => {
                assert_eq!(connect.address, "udp:127.0.0.1:14550");
                assert_eq!(connect.baud, Some(DEFAULT_BAUD));
                assert_eq!(connect.params().timeout_s, Some(5.0));
            }
            other => panic!("Expected connect, got: {:?}", other),
        }
    }

    #[test]
    fn test_parse_connect_with_connection_string() {
        let request = parse_request(r#"{"action":"connect","connection_string":"/dev/ttyUSB0","baud":115200}"#).unwrap();
        match request {
            Request::Action(Action::Connect(connect)) => {
                assert_eq!(connect.address, "/dev/ttyUSB0");
                assert_eq!(connect.params().baud, Some(115200));
            }
            other => panic!("Expected connect, got: {:?}", other),
        }
    }

    #[test]
    fn test_connect_without_address_is_invalid() {
        assert!(matches!(
            parse_request(r#"{"action":"connect"}"#),
            Err(RelayError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_action() {
        assert_eq!(
            parse_request(r#"{"action":"arm"}"#).unwrap(),
            Request::Unknown("arm".to_string())
        );
    }

    #[test]
    fn test_malformed_input() {
        for text in ["not json", "[1,2]", r#"{"act":"x"}"#, r#"{"action":7}"#, ""] {
            assert!(matches!(parse_request(text), Err(RelayError::Protocol(_))), "{:?}", text);
        }
    }

    #[test]
    fn test_response_shapes() {
        assert_eq!(error_response(UNKNOWN_ACTION), r#"{"error":"unknown action"}"#);
        assert_eq!(status_response("connected"), r#"{"status":"connected"}"#);
        let notice: Value = serde_json::from_str(&shutdown_notice()).unwrap();
        assert_eq!(notice["type"], "server_shutdown");
        assert_eq!(notice["message"], "Server is shutting down");
    }
}
