//! Worker lifecycle seam between the transport and its consumers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::envelope::{TransportMessage, WireMessage};
use super::queue::TransportError;
use crate::faults::FailureReason;

/// Per-message control surface handed to observers and, through the message
/// context, to handlers.
#[derive(Clone, Default)]
pub struct WorkerControl {
    abort: Arc<AtomicBool>,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to roll back the current message without counting a
    /// failure. The message returns to the queue and is retried later.
    pub fn abort_handling_current_message(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// Observes the processing lifecycle of received envelopes. All hooks run on
/// the worker thread, inside the receive transaction.
///
/// An `Err` from `started_processing` or `message_received` fails the
/// iteration: the transaction rolls back and the failure counter for the
/// message increments (unless an abort was requested first).
pub trait TransportObserver: Send + Sync {
    /// A message arrived and is about to be handled.
    fn started_processing(
        &self,
        _envelope: &TransportMessage,
        _control: &WorkerControl,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    /// The main handling hook. The bus performs dispatch here.
    fn message_received(
        &self,
        _envelope: &TransportMessage,
        _control: &WorkerControl,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    /// Handling completed and the transaction is about to commit.
    fn finished_processing(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Handling failed. Informational; runs before rollback.
    fn failed_processing(&self, _error: &TransportError) {}

    /// The raw row was moved to the poison store. Informational.
    fn message_fault(&self, _wire: &WireMessage, _reason: FailureReason, _error: Option<&str>) {}
}
