//! The unicast bus facade: routing, publish/subscribe, replies, and the
//! per-message handling context.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      UnicastMessageBus                       │
//! │  send / publish / reply / subscribe                          │
//! │  route table: message type → destination queue               │
//! └──────────────────────────────────────────────────────────────┘
//!       │ observes                           │ dispatches via
//!       ▼                                    ▼
//! ┌───────────────────────────┐  ┌───────────────────────────────┐
//! │  TransactionalTransport   │  │       MessageDispatcher       │
//! │  (receive loop, retries)  │  │  (child scope per envelope)   │
//! └───────────────────────────┘  └───────────────────────────────┘
//! ```

mod builder;
mod bus;
mod context;
mod subscription;

pub use builder::MessageBusBuilder;
pub use bus::{BusObserver, SendError, UnicastMessageBus, SUBSCRIPTION_MESSAGE_TYPE_HEADER};
pub use context::MessageContext;
pub use subscription::{InMemorySubscriptionStorage, SubscriptionStorage};
