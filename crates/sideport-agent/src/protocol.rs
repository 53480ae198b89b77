//! Wire format: one JSON object per line in each direction, discriminated by
//! a `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_TAP_DURATION_MS: u64 = 50;
pub const DEFAULT_SWIPE_DURATION_MS: u64 = 300;
pub const DEFAULT_MULTI_TOUCH_DURATION_MS: u64 = 50;
/// Delay between the starts of consecutive touches in a multi-touch gesture.
pub const MULTI_TOUCH_STAGGER_MS: u64 = 10;

const REQUEST_TYPES: [&str; 5] = ["ping", "tap", "swipe", "multi_touch", "status"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Tap {
        x: i32,
        y: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    Swipe {
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    MultiTouch {
        points: Vec<Point>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    Status,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Welcome {
        message: String,
        version: String,
    },
    Pong {
        timestamp: i64,
    },
    TapResponse {
        success: bool,
        x: i32,
        y: i32,
        duration: u64,
    },
    SwipeResponse {
        success: bool,
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        duration: u64,
    },
    MultiTouchResponse {
        success: bool,
        points: Vec<Point>,
        duration: u64,
    },
    StatusResponse {
        injection_ready: bool,
        server_running: bool,
        connections: usize,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The line is not JSON, or a known request is missing fields.
    #[error("{0}")]
    Malformed(String),

    #[error("Unknown command type: {0}")]
    UnknownType(String),
}

impl From<&ProtocolError> for Response {
    fn from(err: &ProtocolError) -> Self {
        Response::Error {
            message: err.to_string(),
        }
    }
}

/// Decodes one request line. The `type` tag is checked before the payload so
/// an unrecognised command is reported as such rather than as a decode error.
pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing string field `type`".into()))?;
    if !REQUEST_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

pub fn decode_response(line: &str) -> Result<Response, serde_json::Error> {
    serde_json::from_str(line)
}

/// Encodes a message as a single newline-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_decode_with_optional_duration() {
        assert_eq!(decode_request(r#"{"type":"ping"}"#), Ok(Request::Ping));
        assert_eq!(
            decode_request(r#"{"type":"tap","x":10,"y":20}"#),
            Ok(Request::Tap {
                x: 10,
                y: 20,
                duration: None
            })
        );
        assert_eq!(
            decode_request(
                r#"{"type":"swipe","start_x":1,"start_y":2,"end_x":3,"end_y":4,"duration":500}"#
            ),
            Ok(Request::Swipe {
                start_x: 1,
                start_y: 2,
                end_x: 3,
                end_y: 4,
                duration: Some(500)
            })
        );
        assert_eq!(
            decode_request(r#"{"type":"multi_touch","points":[{"x":1,"y":2},{"x":3,"y":4}]}"#),
            Ok(Request::MultiTouch {
                points: vec![Point { x: 1, y: 2 }, Point { x: 3, y: 4 }],
                duration: None
            })
        );
    }

    #[test]
    fn unknown_type_is_named_in_the_error() {
        let err = decode_request(r#"{"type":"teleport","x":1}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("teleport".into()));
        assert_eq!(err.to_string(), "Unknown command type: teleport");
    }

    #[test]
    fn malformed_input_is_a_decode_error() {
        assert!(matches!(
            decode_request("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_request(r#"{"x":1}"#),
            Err(ProtocolError::Malformed(_))
        ));
        let missing = decode_request(r#"{"type":"tap","x":1}"#).unwrap_err();
        assert!(missing.to_string().contains("`y`"), "{missing}");
    }

    #[test]
    fn responses_use_snake_case_tags() {
        let line = encode_line(&Response::TapResponse {
            success: true,
            x: 5,
            y: 6,
            duration: 50,
        })
        .unwrap();
        assert_eq!(
            line,
            "{\"type\":\"tap_response\",\"success\":true,\"x\":5,\"y\":6,\"duration\":50}\n"
        );

        assert_eq!(
            decode_response(line.trim_end()).unwrap(),
            Response::TapResponse {
                success: true,
                x: 5,
                y: 6,
                duration: 50
            }
        );

        let error = Response::from(&ProtocolError::UnknownType("fly".into()));
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            serde_json::json!({"type":"error","message":"Unknown command type: fly"})
        );
    }
}
