//! unibus - a point-to-point / publish-subscribe message bus.
//!
//! Services send typed messages to named destinations, subscribe to message
//! types, and register handlers invoked on receipt. The crate is organized
//! around four pieces:
//!
//! - [`dispatch`] - the handler registry (message-type to handler resolution
//!   with deterministic ordering) and the dispatcher that invokes handlers
//!   inside a per-dispatch scope with unit-of-work hooks.
//! - [`transport`] - the transactional transport: worker threads pull
//!   envelopes from a durable queue, each receive+dispatch wrapped in a
//!   transaction, with per-message retry bookkeeping.
//! - [`faults`] - the poison-message path: permanently failed envelopes are
//!   written to an audit store and forwarded as fault notifications.
//! - [`unicast`] - the bus facade wiring transport to dispatcher and exposing
//!   send / publish / subscribe / reply.
//!
//! Delivery is at-least-once: a failing handler causes the queue transaction
//! to roll back and the envelope to be redelivered, up to a configured retry
//! ceiling, after which it is routed to the poison store. Handlers are
//! expected to be idempotent.

pub mod dispatch;
pub mod faults;
pub mod serializer;
pub mod transport;
pub mod unicast;

pub use dispatch::{
    BasicServiceLocator, DispatchError, DispatchInfo, HandlerError, HandlerRegistry,
    HandlerSource, HandlerType, MessageDispatcher, MessageHandler, MessageTypeRegistry,
    RegistryError, ServiceLocator, UnitOfWorkManager,
};
pub use faults::{InMemoryPoisonStore, PoisonMessageRecord, PoisonMessageStore};
pub use serializer::{EnvelopeSerializer, JsonMessageSerializer, MessageSerializer};
pub use transport::{
    DynMessage, HeaderInfo, InMemoryTransactionalQueue, MessageIntent, MessageQueue,
    TransactionWrapper, TransactionalTransport, TransportError, TransportMessage, WireMessage,
    message,
};
pub use unicast::{
    BusObserver, InMemorySubscriptionStorage, MessageBusBuilder, MessageContext, SendError,
    SubscriptionStorage, UnicastMessageBus,
};
