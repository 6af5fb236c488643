//! Handler registration, resolution, and ordered invocation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     MessageDispatcher                        │
//! │  - unit-of-work begin/end around each batch                  │
//! │  - per-handler scope resolution + invocation                 │
//! └──────────────────────────────────────────────────────────────┘
//!                │                         │
//!                ▼                         ▼
//! ┌───────────────────────────┐  ┌───────────────────────────────┐
//! │      HandlerRegistry      │  │        ServiceLocator         │
//! │  message type → ordered   │  │  resolve / build_up / child   │
//! │  DispatchInfo targets     │  │  (any DI container)           │
//! └───────────────────────────┘  └───────────────────────────────┘
//!                │
//!                ▼
//! ┌───────────────────────────┐
//! │    MessageTypeRegistry    │
//! │  names, conventions, and  │
//! │  structural parent links  │
//! └───────────────────────────┘
//! ```

mod dispatcher;
mod handler;
mod locator;
mod message_types;
mod registry;
mod unit_of_work;

pub use dispatcher::{DispatchError, DispatchObserver, MessageDispatcher};
pub use handler::{HandlerError, HandlerSource, HandlerType, MessageHandler};
pub use locator::{BasicServiceLocator, ServiceLocator, SharedInstance};
pub use message_types::{
    MessageTypeBuilder, MessageTypeConventions, MessageTypeDescriptor, MessageTypeRegistry,
};
pub use registry::{DispatchInfo, HandlerRegistry, RegistryError};
pub use unit_of_work::UnitOfWorkManager;
