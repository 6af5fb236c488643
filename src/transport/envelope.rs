//! The transport envelope - the wire unit carrying a batch of messages.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// A type-erased message object carried in an envelope body.
///
/// Messages are plain structs registered with the serializer and the message
/// type registry; `Arc` keeps envelopes cheaply cloneable.
pub type DynMessage = Arc<dyn Any + Send + Sync>;

/// Wrap a concrete message for an envelope body.
pub fn message<M: Any + Send + Sync>(message: M) -> DynMessage {
    Arc::new(message)
}

/// The intent of an envelope (publish, or regular send).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageIntent {
    /// Regular point-to-point send.
    Send,
    /// Publish, fan-out to subscribers.
    Publish,
    /// Subscription control message.
    Subscribe,
    /// Unsubscription control message.
    Unsubscribe,
    /// A notification synthesized from a permanently failed envelope.
    FaultNotification,
}

impl MessageIntent {
    /// The stable wire code for this intent.
    pub fn as_u8(self) -> u8 {
        match self {
            MessageIntent::Send => 0,
            MessageIntent::Publish => 1,
            MessageIntent::Subscribe => 2,
            MessageIntent::Unsubscribe => 3,
            MessageIntent::FaultNotification => 4,
        }
    }

    /// Decode a wire code; unknown codes fall back to `Send`.
    pub fn from_u8(code: u8) -> Self {
        match code {
            1 => MessageIntent::Publish,
            2 => MessageIntent::Subscribe,
            3 => MessageIntent::Unsubscribe,
            4 => MessageIntent::FaultNotification,
            _ => MessageIntent::Send,
        }
    }
}

/// An applicative out-of-band key/value pair.
///
/// Headers are semantically a mapping but kept as an ordered sequence:
/// order is preserved on the wire and duplicate keys are allowed. An
/// empty-string value is distinct from an absent header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub key: String,
    pub value: String,
}

impl HeaderInfo {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An envelope used to package messages for transmission.
///
/// Created at send time by the bus, deserialized at receive time by the
/// transport, discarded after dispatch completes (or after a poison write).
#[derive(Clone)]
pub struct TransportMessage {
    /// Unique per send attempt.
    pub id: String,
    id_for_correlation: Option<String>,
    /// Links this envelope to a causally-related envelope.
    pub correlation_id: Option<String>,
    /// The queue replies should be sent to.
    pub return_address: String,
    pub intent: MessageIntent,
    /// Maximum time the envelope may wait to be received; `None` is unlimited.
    pub time_to_be_received: Option<Duration>,
    pub time_sent: Option<SystemTime>,
    pub headers: Vec<HeaderInfo>,
    /// The deserialized message batch (typically length 1).
    pub body: Vec<DynMessage>,
}

impl TransportMessage {
    /// Create an outbound envelope. Identity fields are stamped by the
    /// transport at send time.
    pub fn new(intent: MessageIntent, body: Vec<DynMessage>) -> Self {
        Self {
            id: String::new(),
            id_for_correlation: None,
            correlation_id: None,
            return_address: String::new(),
            intent,
            time_to_be_received: None,
            time_sent: None,
            headers: Vec::new(),
            body,
        }
    }

    /// The identifier that stays stable across redeliveries of this envelope.
    pub fn id_for_correlation(&self) -> Option<&str> {
        self.id_for_correlation.as_deref()
    }

    /// Set the stable correlation identity. Immutable once set: later calls
    /// are ignored.
    pub fn set_id_for_correlation(&mut self, id: impl Into<String>) {
        if self.id_for_correlation.is_none() {
            self.id_for_correlation = Some(id.into());
        }
    }

    /// Default the stable correlation identity from `id` if absent.
    pub fn assign_id_for_correlation(&mut self) {
        if self.id_for_correlation.is_none() {
            self.id_for_correlation = Some(self.id.clone());
        }
    }

    /// Look up the first header with the given key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_str())
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push(HeaderInfo::new(key, value));
    }
}

impl fmt::Debug for TransportMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportMessage")
            .field("id", &self.id)
            .field("id_for_correlation", &self.id_for_correlation)
            .field("correlation_id", &self.correlation_id)
            .field("return_address", &self.return_address)
            .field("intent", &self.intent)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// The persisted row shape of an envelope: what queue backends store and
/// what the poison audit record preserves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub id: String,
    pub correlation_id: Option<String>,
    pub reply_to_address: String,
    pub intent: u8,
    /// Serialized header list.
    pub headers: Vec<u8>,
    /// Serialized message batch.
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_codes_round_trip() {
        for intent in [
            MessageIntent::Send,
            MessageIntent::Publish,
            MessageIntent::Subscribe,
            MessageIntent::Unsubscribe,
            MessageIntent::FaultNotification,
        ] {
            assert_eq!(MessageIntent::from_u8(intent.as_u8()), intent);
        }
    }

    #[test]
    fn id_for_correlation_is_set_once() {
        let mut envelope = TransportMessage::new(MessageIntent::Send, Vec::new());
        envelope.id = "first".to_string();
        envelope.assign_id_for_correlation();
        assert_eq!(envelope.id_for_correlation(), Some("first"));

        envelope.set_id_for_correlation("second");
        assert_eq!(envelope.id_for_correlation(), Some("first"));
    }

    #[test]
    fn header_lookup_finds_first_match() {
        let mut envelope = TransportMessage::new(MessageIntent::Send, Vec::new());
        envelope.set_header("tenant", "a");
        envelope.set_header("tenant", "b");
        assert_eq!(envelope.header("tenant"), Some("a"));
        assert_eq!(envelope.header("missing"), None);
    }
}
