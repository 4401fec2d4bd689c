//! Nonce-tagged envelopes and replay de-duplication
//!
//! The transport delivers at least once and in no particular order. Every
//! outbound event is wrapped with a fresh random nonce; the receiving
//! [`EnvelopeCodec`] remembers accepted nonces in a [`NonceRegistry`] and
//! drops any envelope it has seen before.
//!
//! The registry is bounded twice: by entry count (oldest evicted first) and
//! by age (entries older than the configured window are forgotten). A
//! replay older than both bounds is accepted again; the window should be
//! chosen larger than any realistic redelivery delay.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::events::ProtocolEvent;
use crate::error::{ChatError, ChatResult};

/// Nonce length in bytes (hex-encoded on the wire)
pub const NONCE_LEN: usize = 8;

/// Default maximum number of remembered nonces
pub const DEFAULT_NONCE_CAPACITY: usize = 65_536;

/// Default age after which a nonce is forgotten
pub const DEFAULT_NONCE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Bounded record of accepted nonces.
pub struct NonceRegistry {
    /// O(1) membership test.
    seen: HashSet<String>,
    /// Insertion order with insertion time, for eviction.
    order: VecDeque<(String, Instant)>,
    capacity: usize,
    window: Duration,
}

impl NonceRegistry {
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
            window,
        }
    }

    /// Record `nonce` if it is new. Returns `false` for a replay.
    pub fn check_and_insert(&mut self, nonce: &str) -> bool {
        self.check_and_insert_at(nonce, Instant::now())
    }

    /// Same as [`check_and_insert`](Self::check_and_insert) with an explicit clock.
    pub fn check_and_insert_at(&mut self, nonce: &str, now: Instant) -> bool {
        self.evict_expired(now);

        if self.seen.contains(nonce) {
            return false;
        }

        if self.seen.len() >= self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        self.seen.insert(nonce.to_string());
        self.order.push_back((nonce.to_string(), now));
        true
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((_, inserted)) = self.order.front() {
            if now.saturating_duration_since(*inserted) < self.window {
                break;
            }
            if let Some((nonce, _)) = self.order.pop_front() {
                self.seen.remove(&nonce);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for NonceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_CAPACITY, DEFAULT_NONCE_WINDOW)
    }
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    nonce: &'a str,
    payload: &'a ProtocolEvent,
}

/// Outcome of decoding one inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// First delivery of a valid envelope
    Event(ProtocolEvent),
    /// The nonce was already accepted
    Duplicate(String),
}

/// Encodes outbound events and decodes inbound payloads exactly once.
///
/// One codec is shared by every topic of a session so that a message
/// replayed on a different topic is still caught.
pub struct EnvelopeCodec {
    nonces: Mutex<NonceRegistry>,
}

impl EnvelopeCodec {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            nonces: Mutex::new(NonceRegistry::new(capacity, window)),
        }
    }

    /// Generate a fresh hex nonce
    pub fn fresh_nonce() -> String {
        let mut bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Wrap `event` with a fresh nonce and serialize it.
    pub fn encode(&self, event: &ProtocolEvent) -> ChatResult<Vec<u8>> {
        Self::encode_with_nonce(event, &Self::fresh_nonce())
    }

    /// Wrap `event` with a caller-chosen nonce.
    pub fn encode_with_nonce(event: &ProtocolEvent, nonce: &str) -> ChatResult<Vec<u8>> {
        if let ProtocolEvent::Unknown { kind } = event {
            return Err(ChatError::Serialization(format!(
                "Cannot encode unknown event kind {}",
                kind
            )));
        }
        let envelope = OutboundEnvelope {
            nonce,
            payload: event,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Decode a payload, returning the event on first delivery only.
    ///
    /// Malformed payloads and duplicates are logged and yield `None`.
    pub fn decode(&self, data: &[u8]) -> Option<ProtocolEvent> {
        match self.try_decode(data) {
            Ok(Decoded::Event(event)) => Some(event),
            Ok(Decoded::Duplicate(nonce)) => {
                warn!(%nonce, "Dropping duplicate envelope");
                None
            }
            Err(e) => {
                warn!(error = %e, len = data.len(), "Dropping malformed envelope");
                None
            }
        }
    }

    /// Decode a payload, reporting why it was rejected.
    ///
    /// The nonce is recorded only once the payload parsed, so a malformed
    /// envelope never poisons a later well-formed one with the same nonce.
    pub fn try_decode(&self, data: &[u8]) -> ChatResult<Decoded> {
        let value: Value = serde_json::from_slice(data)
            .map_err(|e| ChatError::MalformedMessage(format!("Not JSON: {}", e)))?;

        let envelope = value
            .as_object()
            .ok_or_else(|| ChatError::MalformedMessage("Envelope is not an object".into()))?;

        let nonce = match envelope.get("nonce") {
            None | Some(Value::Null) => {
                return Err(ChatError::MalformedMessage("Missing nonce".into()));
            }
            Some(value) => value,
        };

        let payload = envelope
            .get("payload")
            .and_then(Value::as_object)
            .ok_or_else(|| ChatError::MalformedMessage("Missing payload object".into()))?;

        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ChatError::MalformedMessage("Payload type is not a string".into()))?;

        let event = if ProtocolEvent::KNOWN_KINDS.contains(&kind) {
            let mut body = payload.clone();
            match body.get("payload") {
                None | Some(Value::Null) => {
                    body.insert("payload".into(), Value::Object(Default::default()));
                }
                Some(_) => {}
            }
            serde_json::from_value(Value::Object(body))
                .map_err(|e| ChatError::MalformedMessage(format!("{}: {}", kind, e)))?
        } else {
            ProtocolEvent::Unknown {
                kind: kind.to_string(),
            }
        };

        let (nonce, key) = nonce_key(nonce);
        if !self.nonces.lock().check_and_insert(&key) {
            return Ok(Decoded::Duplicate(nonce));
        }

        debug!(kind = event.kind(), %nonce, "Decoded envelope");
        Ok(Decoded::Event(event))
    }

    /// Number of nonces currently remembered
    pub fn remembered(&self) -> usize {
        self.nonces.lock().len()
    }
}

/// Display text and registry key of a nonce.
///
/// The key carries the JSON type, so `12345` and `"12345"` are different
/// nonces.
fn nonce_key(nonce: &Value) -> (String, String) {
    let (kind, text) = match nonce {
        Value::String(s) => ("string", s.clone()),
        Value::Number(n) => ("number", n.to_string()),
        Value::Bool(b) => ("bool", b.to_string()),
        Value::Array(_) => ("array", nonce.to_string()),
        Value::Object(_) => ("object", nonce.to_string()),
        Value::Null => ("null", String::new()),
    };
    let key = format!("{}:{}", kind, text);
    (text, key)
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_CAPACITY, DEFAULT_NONCE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::events::TopicMessagePayload;
    use crate::types::MessageBlock;

    fn message(text: &str) -> ProtocolEvent {
        ProtocolEvent::TopicMessage(TopicMessagePayload {
            blocks: vec![MessageBlock::text(text)],
        })
    }

    #[test]
    fn test_encode_decode() {
        let codec = EnvelopeCodec::default();
        let event = message("hello");

        let bytes = codec.encode(&event).unwrap();
        assert_eq!(codec.decode(&bytes), Some(event));
    }

    #[test]
    fn test_envelope_shape() {
        let bytes = EnvelopeCodec::encode_with_nonce(&message("x"), "0011223344556677").unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["nonce"], "0011223344556677");
        assert_eq!(value["payload"]["type"], "TOPIC_MESSAGE");
        assert_eq!(value["payload"]["payload"]["blocks"][0]["text"], "x");
    }

    #[test]
    fn test_fresh_nonces_differ() {
        let a = EnvelopeCodec::fresh_nonce();
        let b = EnvelopeCodec::fresh_nonce();
        assert_eq!(a.len(), NONCE_LEN * 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_duplicate_is_dropped() {
        let codec = EnvelopeCodec::default();
        let bytes = codec.encode(&message("once")).unwrap();

        assert!(codec.decode(&bytes).is_some());
        assert!(codec.decode(&bytes).is_none());
        assert!(matches!(codec.try_decode(&bytes), Ok(Decoded::Duplicate(_))));
        assert_eq!(codec.remembered(), 1);
    }

    #[test]
    fn test_structural_failures() {
        let codec = EnvelopeCodec::default();

        let cases = [
            "not json",
            "[1,2,3]",
            r#"{"payload":{"type":"TOPIC_TYPING","payload":{"typing":true}}}"#,
            r#"{"nonce":null,"payload":{"type":"TOPIC_TYPING","payload":{"typing":true}}}"#,
            r#"{"nonce":"aa"}"#,
            r#"{"nonce":"aa","payload":"TOPIC_TYPING"}"#,
            r#"{"nonce":"aa","payload":{"type":7}}"#,
        ];

        for case in cases {
            assert!(
                matches!(codec.try_decode(case.as_bytes()), Err(ChatError::MalformedMessage(_))),
                "expected malformed: {}",
                case
            );
        }
        assert_eq!(codec.remembered(), 0);
    }

    #[test]
    fn test_malformed_body_does_not_consume_nonce() {
        let codec = EnvelopeCodec::default();

        let bad = br#"{"nonce":"n1","payload":{"type":"TOPIC_TYPING","payload":{"typing":"yes"}}}"#;
        assert!(matches!(codec.try_decode(bad), Err(ChatError::MalformedMessage(_))));

        let good = br#"{"nonce":"n1","payload":{"type":"TOPIC_TYPING","payload":{"typing":true}}}"#;
        assert_eq!(codec.decode(good), Some(ProtocolEvent::typing(true)));
    }

    #[test]
    fn test_unknown_kind_is_preserved() {
        let codec = EnvelopeCodec::default();
        let data = br#"{"nonce":"n2","payload":{"type":"READ_RECEIPT","payload":{"upTo":4}}}"#;

        assert_eq!(
            codec.decode(data),
            Some(ProtocolEvent::Unknown {
                kind: "READ_RECEIPT".into()
            })
        );
        // Unknown kinds still consume their nonce.
        assert!(codec.decode(data).is_none());
    }

    #[test]
    fn test_profile_request_without_body() {
        let codec = EnvelopeCodec::default();
        let data = br#"{"nonce":"n3","payload":{"type":"PROFILE_REQUEST"}}"#;
        assert_eq!(codec.decode(data), Some(ProtocolEvent::profile_request()));
    }

    #[test]
    fn test_numeric_nonce_is_deduplicated() {
        let codec = EnvelopeCodec::default();
        let data = br#"{"nonce":12345,"payload":{"type":"TOPIC_TYPING","payload":{"typing":false}}}"#;
        assert!(codec.decode(data).is_some());
        assert!(codec.decode(data).is_none());
    }

    #[test]
    fn test_nonce_type_is_part_of_identity() {
        let codec = EnvelopeCodec::default();
        let number = br#"{"nonce":12345,"payload":{"type":"TOPIC_TYPING","payload":{"typing":false}}}"#;
        let string = br#"{"nonce":"12345","payload":{"type":"TOPIC_TYPING","payload":{"typing":false}}}"#;
        let tagged = br#"{"nonce":"number:12345","payload":{"type":"TOPIC_TYPING","payload":{"typing":false}}}"#;

        assert!(codec.decode(number).is_some());
        assert!(codec.decode(string).is_some());
        assert!(codec.decode(tagged).is_some());
        assert!(matches!(
            codec.try_decode(string),
            Ok(Decoded::Duplicate(nonce)) if nonce == "12345"
        ));
        assert_eq!(codec.remembered(), 3);
    }

    #[test]
    fn test_encode_unknown_fails() {
        let codec = EnvelopeCodec::default();
        let result = codec.encode(&ProtocolEvent::Unknown { kind: "X".into() });
        assert!(matches!(result, Err(ChatError::Serialization(_))));
    }

    #[test]
    fn test_registry_capacity_eviction() {
        let mut registry = NonceRegistry::new(3, DEFAULT_NONCE_WINDOW);
        let now = Instant::now();

        assert!(registry.check_and_insert_at("a", now));
        assert!(registry.check_and_insert_at("b", now));
        assert!(registry.check_and_insert_at("c", now));
        assert!(registry.check_and_insert_at("d", now));
        assert_eq!(registry.len(), 3);

        // "a" was evicted, "b" was not
        assert!(!registry.check_and_insert_at("b", now));
        assert!(registry.check_and_insert_at("a", now));
    }

    #[test]
    fn test_registry_window_eviction() {
        let window = Duration::from_secs(60);
        let mut registry = NonceRegistry::new(100, window);
        let start = Instant::now();

        assert!(registry.check_and_insert_at("a", start));
        assert!(!registry.check_and_insert_at("a", start + Duration::from_secs(59)));
        assert!(registry.check_and_insert_at("a", start + Duration::from_secs(61)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_zero_capacity_treated_as_one() {
        let mut registry = NonceRegistry::new(0, DEFAULT_NONCE_WINDOW);
        assert!(registry.check_and_insert("a"));
        assert!(registry.check_and_insert("b"));
        assert_eq!(registry.len(), 1);
    }
}
