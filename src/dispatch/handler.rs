//! Handler trait and explicit handler registration.
//!
//! Handlers declare the message types they handle at startup; there is no
//! runtime scanning. `HandlerType::describe` captures, per declared message
//! type, a type-erased invoker plus a default-construction factory used when
//! the dispatch scope does not provide an instance.

use std::any::{Any, TypeId};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::unicast::MessageContext;

/// The error a handler surfaces to the dispatch pipeline.
#[derive(Debug)]
pub struct HandlerError {
    message: String,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for HandlerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// A message handler for messages of type `M`.
///
/// One handler type may implement this for several message types; each is
/// declared separately via [`HandlerType::handles`].
pub trait MessageHandler<M>: Any + Send {
    fn handle(&mut self, message: &M, ctx: &MessageContext) -> Result<(), HandlerError>;
}

pub(crate) type HandlerInvoker =
    Arc<dyn Fn(&mut dyn Any, &dyn Any, &MessageContext) -> Result<(), HandlerError> + Send + Sync>;
pub(crate) type HandlerFactory = Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

/// One declared (handler type, message type) dispatch edge.
pub(crate) struct HandlerTarget {
    pub message_type: TypeId,
    pub invoke: HandlerInvoker,
}

/// The erased description of one handler type: identity, declared targets
/// (in declaration order), and a factory for scope fallback construction.
pub(crate) struct HandlerDescriptor {
    pub type_id: TypeId,
    pub name: String,
    pub targets: Vec<HandlerTarget>,
    pub factory: HandlerFactory,
}

/// Describes a candidate handler type and the message types it handles.
///
/// ```ignore
/// HandlerType::<OrderHandler>::describe("OrderHandler")
///     .handles::<OrderPlaced>()
///     .handles::<OrderCancelled>()
/// ```
pub struct HandlerType<H> {
    inner: HandlerDescriptor,
    _marker: std::marker::PhantomData<H>,
}

impl<H: Any + Send + Default> HandlerType<H> {
    pub fn describe(name: impl Into<String>) -> Self {
        Self {
            inner: HandlerDescriptor {
                type_id: TypeId::of::<H>(),
                name: name.into(),
                targets: Vec::new(),
                factory: Arc::new(|| Box::new(H::default())),
            },
            _marker: std::marker::PhantomData,
        }
    }

    /// Declare that this handler handles messages of type `M`.
    pub fn handles<M: Any + Send + Sync>(mut self) -> Self
    where
        H: MessageHandler<M>,
    {
        let invoke: HandlerInvoker = Arc::new(
            |handler: &mut dyn Any, message: &dyn Any, ctx: &MessageContext| {
                let handler = handler
                    .downcast_mut::<H>()
                    .ok_or_else(|| HandlerError::new("handler instance type mismatch"))?;
                let message = message
                    .downcast_ref::<M>()
                    .ok_or_else(|| HandlerError::new("message view type mismatch"))?;
                handler.handle(message, ctx)
            },
        );
        self.inner.targets.push(HandlerTarget {
            message_type: TypeId::of::<M>(),
            invoke,
        });
        self
    }

    pub(crate) fn into_descriptor(self) -> HandlerDescriptor {
        self.inner
    }
}

/// A set of candidate handler types accumulated before registry init.
#[derive(Default)]
pub struct HandlerSource {
    pub(crate) handlers: Vec<HandlerDescriptor>,
}

impl HandlerSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler<H: Any + Send + Default>(mut self, handler_type: HandlerType<H>) -> Self {
        self.handlers.push(handler_type.into_descriptor());
        self
    }
}
