//! Message body and envelope serialization.
//!
//! The body codec is pluggable behind [`MessageSerializer`];
//! [`JsonMessageSerializer`] is the in-crate implementation (serde_json).
//! [`EnvelopeSerializer`] wraps a body codec and converts between
//! [`TransportMessage`](crate::transport::TransportMessage) and the persisted
//! [`WireMessage`](crate::transport::WireMessage) row, serializing envelope
//! metadata separately from the message payload.

mod envelope;
mod json;

pub use envelope::{decode_headers, encode_headers, EnvelopeSerializer};
pub use json::JsonMessageSerializer;

use std::error::Error;
use std::fmt;

use crate::transport::DynMessage;

/// Why serialization or deserialization failed. Deserialization failures at
/// receive time are permanent: the envelope goes to the poison store, never
/// the retry path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
    /// The message's concrete type was never registered with the codec.
    UnregisteredType(String),
    /// The wire names a type this endpoint does not know.
    UnknownTypeName(String),
    /// The payload or header bytes were malformed.
    Malformed(String),
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::UnregisteredType(name) => {
                write!(f, "message type {} is not registered with the serializer", name)
            }
            SerializationError::UnknownTypeName(name) => {
                write!(f, "unknown message type name on the wire: {}", name)
            }
            SerializationError::Malformed(detail) => {
                write!(f, "malformed message data: {}", detail)
            }
        }
    }
}

impl Error for SerializationError {}

/// Serializes and deserializes message batches.
pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, messages: &[DynMessage]) -> Result<Vec<u8>, SerializationError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<DynMessage>, SerializationError>;
}
