//! Queue backend contracts consumed by the transactional transport.

use std::error::Error;
use std::fmt;

use super::envelope::WireMessage;
use crate::dispatch::DispatchError;
use crate::serializer::SerializationError;

/// Why a transport operation failed.
#[derive(Debug)]
pub enum TransportError {
    /// The queue backend failed (connection, missing queue, storage).
    Queue(String),
    /// The envelope could not be serialized or deserialized.
    Serialization(SerializationError),
    /// Dispatch of the received envelope failed; causes rollback and a
    /// failure-count increment.
    HandlingFailed(DispatchError),
    /// A lifecycle hook failed; causes rollback.
    Hook(String),
    /// A handler requested deferral of the current message; causes rollback
    /// without counting a failure.
    Aborted,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Queue(detail) => write!(f, "queue error: {}", detail),
            TransportError::Serialization(e) => write!(f, "serialization failed: {}", e),
            TransportError::HandlingFailed(e) => write!(f, "message handling failed: {}", e),
            TransportError::Hook(detail) => write!(f, "lifecycle hook failed: {}", detail),
            TransportError::Aborted => write!(f, "handling of the current message was aborted"),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::Serialization(e) => Some(e),
            TransportError::HandlingFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SerializationError> for TransportError {
    fn from(e: SerializationError) -> Self {
        TransportError::Serialization(e)
    }
}

impl From<DispatchError> for TransportError {
    fn from(e: DispatchError) -> Self {
        TransportError::HandlingFailed(e)
    }
}

/// Opaque handle identifying the transaction an operation runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionToken(u64);

impl TransactionToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Transactional scoping for queue operations.
///
/// Reentrant: a nested call from inside a callback joins the outer
/// transaction, and only the outermost call commits or rolls back.
pub trait TransactionWrapper: Send + Sync {
    fn run_in_transaction(
        &self,
        callback: &mut dyn FnMut(&TransactionToken) -> Result<(), TransportError>,
    ) -> Result<(), TransportError>;
}

/// A durable, transactional message queue.
///
/// `receive_one_locked` must use skip-locked semantics: a row locked by one
/// in-flight transaction is invisible to concurrent receivers, so no two
/// workers can ever receive the same physical message. The transport relies
/// on this contract rather than inventing its own distributed lock.
pub trait MessageQueue: Send + Sync {
    /// Prepare the listener queue (create it if the backend supports that).
    fn start(&self, listener_queue: &str) -> Result<(), TransportError>;

    /// Receive and lock the oldest available row, or `None` when the queue
    /// has no unlocked rows. The row is deleted on commit, unlocked on
    /// rollback.
    fn receive_one_locked(
        &self,
        tx: &TransactionToken,
        queue: &str,
    ) -> Result<Option<WireMessage>, TransportError>;

    /// Insert a row into a destination queue, visible to receivers once the
    /// transaction commits.
    fn insert_one(
        &self,
        tx: &TransactionToken,
        destination: &str,
        wire: &WireMessage,
    ) -> Result<(), TransportError>;
}
