//! Wire envelope (de)serialization.
//!
//! An envelope is the unit of bidirectional messaging over the operator
//! transport: `{ "type": <kind>, "payload": <object>, "timestamp": <float> }`.
//! Unknown fields are ignored; missing fields fall back to documented
//! defaults rather than failing to parse, since a malformed envelope should
//! be dropped by the caller, not panic the decoder.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An addressed message exchanged with the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: String,
    pub payload: Map<String, Value>,
    pub timestamp: f64,
}

impl Envelope {
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind: kind.into(),
            payload,
            timestamp: wall_clock_secs(),
        }
    }

    /// Decode a wire frame, applying the defaulting rules below instead
    /// of failing outright on missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error only when `text` is not valid JSON at all.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        Ok(Self {
            kind: raw.kind.unwrap_or_else(|| "unknown".to_string()),
            payload: raw.payload.unwrap_or_default(),
            timestamp: raw.timestamp.unwrap_or_else(wall_clock_secs),
        })
    }

    #[must_use]
    pub fn encode(&self) -> String {
        let wire = WireEnvelope {
            kind: &self.kind,
            payload: &self.payload,
            timestamp: self.timestamp,
        };
        serde_json::to_string(&wire).unwrap_or_else(|_| {
            r#"{"type":"unknown","payload":{},"timestamp":0}"#.to_string()
        })
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    payload: Option<Map<String, Value>>,
    timestamp: Option<f64>,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: &'a Map<String, Value>,
    timestamp: f64,
}

#[must_use]
pub fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_full_envelope() {
        let text = r#"{"type":"ping","payload":{"a":1},"timestamp":123.5}"#;
        let env = Envelope::decode(text).unwrap();
        assert_eq!(env.kind, "ping");
        assert_eq!(env.payload["a"], 1);
        assert!((env.timestamp - 123.5).abs() < f64::EPSILON);
    }

    #[test]
    fn decode_missing_type_defaults_unknown() {
        let text = r#"{"payload":{},"timestamp":1.0}"#;
        let env = Envelope::decode(text).unwrap();
        assert_eq!(env.kind, "unknown");
    }

    #[test]
    fn decode_missing_payload_defaults_empty() {
        let text = r#"{"type":"ping","timestamp":1.0}"#;
        let env = Envelope::decode(text).unwrap();
        assert!(env.payload.is_empty());
    }

    #[test]
    fn decode_missing_timestamp_defaults_to_now() {
        let text = r#"{"type":"ping","payload":{}}"#;
        let env = Envelope::decode(text).unwrap();
        assert!(env.timestamp > 0.0);
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let text = r#"{"type":"ping","payload":{},"timestamp":1.0,"extra":"ignored"}"#;
        assert!(Envelope::decode(text).is_ok());
    }

    #[test]
    fn decode_invalid_json_errors() {
        assert!(Envelope::decode("not json").is_err());
    }

    #[test]
    fn encode_round_trip() {
        let env = Envelope::new("pong", json!({"agent_id": "a1"}));
        let text = env.encode();
        let decoded = Envelope::decode(&text).unwrap();
        assert_eq!(decoded.kind, "pong");
        assert_eq!(decoded.payload["agent_id"], "a1");
    }

    #[test]
    fn new_with_non_object_payload_defaults_empty() {
        let env = Envelope::new("x", json!("not an object"));
        assert!(env.payload.is_empty());
    }
}
