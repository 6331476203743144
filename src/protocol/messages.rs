//! Message types flowing through the subscription worker
//!
//! An [`InboundMessage`] is what the broker hands us, a [`ProducedEvent`] is
//! what the worker hands to the sink. [`decode_payload`] sits between them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One (topic, payload) pair delivered by the broker client
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Concrete topic the message was published on (never a wildcard)
    pub topic: String,
    /// Raw payload bytes as received
    pub payload: Bytes,
    /// When the broker client handed the message over
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Create an inbound message stamped with the current time
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Result of best-effort payload decoding
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    /// Payload parsed as JSON
    Structured(Value),
    /// Payload passed through unchanged as text
    Raw(String),
}

impl DecodedPayload {
    pub fn is_structured(&self) -> bool {
        matches!(self, DecodedPayload::Structured(_))
    }
}

impl From<DecodedPayload> for Value {
    fn from(decoded: DecodedPayload) -> Self {
        match decoded {
            DecodedPayload::Structured(value) => value,
            DecodedPayload::Raw(text) => Value::String(text),
        }
    }
}

/// Decode a raw payload: JSON if it parses, otherwise the original text.
///
/// Never fails. Bytes that are not valid UTF-8 are passed through with
/// replacement characters, since the produced event is JSON and cannot carry
/// arbitrary bytes.
///
/// # Examples
/// ```
/// use mqtt_agent::protocol::{decode_payload, DecodedPayload};
/// use serde_json::json;
///
/// assert_eq!(
///     decode_payload(br#"{"lat":"-34.85"}"#),
///     DecodedPayload::Structured(json!({"lat": "-34.85"}))
/// );
/// assert_eq!(
///     decode_payload(b"not json at all"),
///     DecodedPayload::Raw("not json at all".to_string())
/// );
/// ```
pub fn decode_payload(raw: &[u8]) -> DecodedPayload {
    match serde_json::from_slice::<Value>(raw) {
        Ok(value) => DecodedPayload::Structured(value),
        Err(_) => DecodedPayload::Raw(String::from_utf8_lossy(raw).into_owned()),
    }
}

/// Normalized output record, one per inbound message
///
/// Wire shape: `{"topic": "...", "message": <object-or-string>, "time": <epoch-seconds>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducedEvent {
    pub topic: String,
    pub message: Value,
    /// Unix epoch seconds
    pub time: i64,
}

impl ProducedEvent {
    /// Build an event from an inbound message, decoding its payload.
    ///
    /// Also reports whether the payload had to fall back to raw text.
    pub fn from_inbound(message: &InboundMessage) -> (Self, bool) {
        let decoded = decode_payload(&message.payload);
        let passed_through = !decoded.is_structured();
        let event = Self {
            topic: message.topic.clone(),
            message: decoded.into(),
            time: message.received_at.timestamp(),
        };
        (event, passed_through)
    }
}
