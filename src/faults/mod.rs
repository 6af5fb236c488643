//! Permanent failure handling.
//!
//! A message that exhausts its retries, or that cannot be deserialized at
//! all, leaves the processing loop through here: the raw wire row is written
//! to a [`PoisonMessageStore`] for later inspection, and the transport can
//! additionally forward a fault notification envelope to an operator queue.

mod poison;

pub use poison::{InMemoryPoisonStore, PoisonMessageRecord, PoisonMessageStore};

use std::error::Error;
use std::fmt;

/// Fault notification headers carrying the failure provenance.
pub const FAULT_REASON_HEADER: &str = "unibus.fault.reason";
pub const FAULT_MESSAGE_ID_HEADER: &str = "unibus.fault.message-id";
pub const FAULT_SOURCE_QUEUE_HEADER: &str = "unibus.fault.source-queue";
pub const FAULT_EXCEPTION_HEADER: &str = "unibus.fault.exception";

/// Why a message was written to the poison store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The wire row could not be deserialized. Never retried.
    SerializationFailed,
    /// Handling failed and the retry limit was reached.
    ProcessingFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::SerializationFailed => write!(f, "serialization failed"),
            FailureReason::ProcessingFailed => write!(f, "processing failed"),
        }
    }
}

/// Render an error and its full source chain into one line.
pub fn format_error_chain(error: &(dyn Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str("; caused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Leaf;

    impl fmt::Display for Leaf {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "disk full")
        }
    }

    impl Error for Leaf {}

    #[derive(Debug)]
    struct Wrapper(Leaf);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "write failed")
        }
    }

    impl Error for Wrapper {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn error_chain_includes_every_source() {
        let rendered = format_error_chain(&Wrapper(Leaf));
        assert_eq!(rendered, "write failed; caused by: disk full");
    }
}
