//! Transactional message transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   TransactionalTransport                     │
//! │  worker threads: receive → deserialize → observer hooks      │
//! │  retry bookkeeping, poison path, fault forwarding            │
//! └──────────────────────────────────────────────────────────────┘
//!          │ one transaction per iteration            │
//!          ▼                                          ▼
//! ┌───────────────────────────┐  ┌───────────────────────────────┐
//! │ MessageQueue +            │  │      EnvelopeSerializer       │
//! │ TransactionWrapper        │  │  TransportMessage ⇄ wire row  │
//! │ (skip-locked receive)     │  └───────────────────────────────┘
//! └───────────────────────────┘
//! ```
//!
//! The physical receive, handler sends, and poison writes for one message
//! share one queue transaction. A handling failure rolls everything back and
//! the message is redelivered until its retry limit moves it to the poison
//! store.

mod backoff;
mod envelope;
mod events;
mod in_memory_queue;
mod queue;
mod semaphore;
mod transactional;

pub use envelope::{message, DynMessage, HeaderInfo, MessageIntent, TransportMessage, WireMessage};
pub use events::{TransportObserver, WorkerControl};
pub use in_memory_queue::InMemoryTransactionalQueue;
pub use queue::{MessageQueue, TransactionToken, TransactionWrapper, TransportError};
pub use transactional::TransactionalTransport;
