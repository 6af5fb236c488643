//! Envelope metadata serialization: `TransportMessage` ⇄ `WireMessage`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{MessageSerializer, SerializationError};
use crate::transport::{HeaderInfo, MessageIntent, TransportMessage, WireMessage};

// Envelope fields without a dedicated wire column ride in reserved headers,
// stripped back out at receive time.
const TIME_SENT_HEADER: &str = "unibus.time-sent";
const ID_FOR_CORRELATION_HEADER: &str = "unibus.id-for-correlation";
const TIME_TO_BE_RECEIVED_HEADER: &str = "unibus.time-to-be-received";

/// Converts envelopes to and from their persisted row shape, serializing
/// metadata (id, correlation, headers, intent) separately from the message
/// body payload.
pub struct EnvelopeSerializer {
    body: Arc<dyn MessageSerializer>,
}

impl EnvelopeSerializer {
    pub fn new(body: Arc<dyn MessageSerializer>) -> Self {
        Self { body }
    }

    pub fn body_serializer(&self) -> &Arc<dyn MessageSerializer> {
        &self.body
    }

    /// Serialize an envelope for transmission.
    pub fn seal(&self, envelope: &TransportMessage) -> Result<WireMessage, SerializationError> {
        let mut headers = envelope.headers.clone();
        if let Some(time_sent) = envelope.time_sent {
            headers.push(HeaderInfo::new(TIME_SENT_HEADER, encode_millis(time_sent)));
        }
        if let Some(id) = envelope.id_for_correlation() {
            headers.push(HeaderInfo::new(ID_FOR_CORRELATION_HEADER, id));
        }
        if let Some(ttbr) = envelope.time_to_be_received {
            headers.push(HeaderInfo::new(
                TIME_TO_BE_RECEIVED_HEADER,
                ttbr.as_millis().to_string(),
            ));
        }
        Ok(WireMessage {
            id: envelope.id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            reply_to_address: envelope.return_address.clone(),
            intent: envelope.intent.as_u8(),
            headers: encode_headers(&headers)?,
            body: self.body.serialize(&envelope.body)?,
        })
    }

    /// Deserialize a received row back into an envelope.
    ///
    /// The caller keeps the `WireMessage` alongside: the raw bytes are what
    /// the poison path preserves when processing fails permanently.
    pub fn open(&self, wire: &WireMessage) -> Result<TransportMessage, SerializationError> {
        let mut headers = decode_headers(&wire.headers)?;
        let time_sent = take_header(&mut headers, TIME_SENT_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .map(decode_millis);
        let id_for_correlation = take_header(&mut headers, ID_FOR_CORRELATION_HEADER);
        let time_to_be_received = take_header(&mut headers, TIME_TO_BE_RECEIVED_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);

        let mut envelope = TransportMessage::new(
            MessageIntent::from_u8(wire.intent),
            self.body.deserialize(&wire.body)?,
        );
        envelope.id = wire.id.clone();
        envelope.correlation_id = wire.correlation_id.clone();
        envelope.return_address = wire.reply_to_address.clone();
        envelope.time_sent = time_sent;
        envelope.time_to_be_received = time_to_be_received;
        envelope.headers = headers;
        if let Some(id) = id_for_correlation {
            envelope.set_id_for_correlation(id);
        }
        Ok(envelope)
    }
}

/// Serialize a header list independently of the body codec.
pub fn encode_headers(headers: &[HeaderInfo]) -> Result<Vec<u8>, SerializationError> {
    serde_json::to_vec(headers).map_err(|e| SerializationError::Malformed(e.to_string()))
}

/// Deserialize a header list; empty bytes mean no headers.
pub fn decode_headers(bytes: &[u8]) -> Result<Vec<HeaderInfo>, SerializationError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(bytes).map_err(|e| SerializationError::Malformed(e.to_string()))
}

fn take_header(headers: &mut Vec<HeaderInfo>, key: &str) -> Option<String> {
    let pos = headers.iter().position(|h| h.key == key)?;
    Some(headers.remove(pos).value)
}

fn encode_millis(time: SystemTime) -> String {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
        .to_string()
}

fn decode_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}
