//! The dispatcher: resolves handlers for a received batch and invokes them
//! in order inside a per-dispatch scope.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use super::handler::HandlerError;
use super::locator::ServiceLocator;
use super::registry::{HandlerRegistry, RegistryError};
use super::unit_of_work::UnitOfWorkManager;
use crate::transport::DynMessage;
use crate::unicast::MessageContext;

/// Why a dispatch call failed.
#[derive(Debug)]
pub enum DispatchError {
    /// A handler surfaced an error; the remaining chain was not invoked.
    Handler {
        handler: String,
        message_type: String,
        source: HandlerError,
    },
    /// A unit-of-work manager failed in `begin` or `end`.
    UnitOfWork(String),
    /// The registry was misused (not initialized).
    Registry(RegistryError),
    /// A message could not be viewed as the handler's declared target type.
    Projection {
        handler: String,
        message_type: String,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Handler {
                handler,
                message_type,
                source,
            } => write!(
                f,
                "handler {} failed for message type {}: {}",
                handler, message_type, source
            ),
            DispatchError::UnitOfWork(detail) => {
                write!(f, "unit of work manager failed: {}", detail)
            }
            DispatchError::Registry(e) => write!(f, "handler registry error: {}", e),
            DispatchError::Projection {
                handler,
                message_type,
            } => write!(
                f,
                "message cannot be projected to {} for handler {}",
                message_type, handler
            ),
        }
    }
}

impl Error for DispatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DispatchError::Handler { source, .. } => Some(source),
            DispatchError::Registry(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(e: RegistryError) -> Self {
        DispatchError::Registry(e)
    }
}

/// Observes dispatch lifecycle. The scope and the error are always available
/// to observers. Invoked synchronously, in registration order.
pub trait DispatchObserver: Send + Sync {
    fn dispatching(&self, _scope: &dyn ServiceLocator, _ctx: &MessageContext) {}

    fn dispatched(
        &self,
        _scope: &dyn ServiceLocator,
        _ctx: &MessageContext,
        _error: Option<&DispatchError>,
    ) {
    }

    fn dispatch_exception(
        &self,
        _scope: &dyn ServiceLocator,
        _ctx: &MessageContext,
        _error: &DispatchError,
    ) {
    }
}

/// Resolves handlers via the registry and invokes them in order, wrapping
/// the batch in unit-of-work begin/end hooks.
///
/// Handlers for one message run fully before the next message in the batch
/// begins. A handler failure aborts the remaining chain; the error is
/// surfaced to the caller (the transport decides retry vs. poison - the
/// dispatcher never retries).
pub struct MessageDispatcher {
    service_locator: Arc<dyn ServiceLocator>,
    handlers: Arc<HandlerRegistry>,
    unit_of_work_managers: Vec<Arc<dyn UnitOfWorkManager>>,
    observers: Vec<Arc<dyn DispatchObserver>>,
}

impl MessageDispatcher {
    pub fn new(service_locator: Arc<dyn ServiceLocator>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            service_locator,
            handlers,
            unit_of_work_managers: Vec::new(),
            observers: Vec::new(),
        }
    }

    pub fn with_unit_of_work_manager(mut self, manager: Arc<dyn UnitOfWorkManager>) -> Self {
        self.unit_of_work_managers.push(manager);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// The root scope child scopes are cloned from.
    pub fn service_locator(&self) -> &Arc<dyn ServiceLocator> {
        &self.service_locator
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Dispatch a message batch within `scope`.
    ///
    /// Unit-of-work `begin` runs once per call (batch level, not per
    /// handler); `end` always runs, in the same order, with the surfaced
    /// error if any.
    pub fn dispatch_messages(
        &self,
        scope: &dyn ServiceLocator,
        messages: &[DynMessage],
        ctx: &MessageContext,
    ) -> Result<(), DispatchError> {
        let mut outcome = self.on_dispatching(scope, ctx);

        if outcome.is_ok() {
            outcome = self.dispatch_batch(scope, messages, ctx);
        }

        if let Err(error) = &outcome {
            warn!(
                "failed dispatching messages for message with id={}: {}",
                ctx.message_id(),
                error
            );
            for observer in &self.observers {
                observer.dispatch_exception(scope, ctx, error);
            }
        }

        let end_result = self.on_dispatched(scope, ctx, outcome.as_ref().err());
        match outcome {
            Err(error) => Err(error),
            Ok(()) => end_result,
        }
    }

    fn dispatch_batch(
        &self,
        scope: &dyn ServiceLocator,
        messages: &[DynMessage],
        ctx: &MessageContext,
    ) -> Result<(), DispatchError> {
        for message in messages {
            let runtime_type = (**message).type_id();
            let type_name = self.type_name(runtime_type);
            for info in self.handlers.resolve_handlers_for(runtime_type)? {
                let view = self
                    .handlers
                    .message_types()
                    .project(message.as_ref(), info.message_type)
                    .ok_or_else(|| DispatchError::Projection {
                        handler: info.handler_name.clone(),
                        message_type: self.type_name(info.message_type),
                    })?;

                debug!(
                    "dispatching message {} to handler {}",
                    type_name, info.handler_name
                );

                let result = match scope.resolve(info.handler_type) {
                    // Scope-provided instance: locked for the invocation,
                    // never dropped here.
                    Some(shared) => {
                        let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
                        scope.build_up(guard.as_mut());
                        (info.invoke)(guard.as_mut(), view, ctx)
                    }
                    // Fallback construction: the instance is dropped after
                    // use.
                    None => {
                        let mut instance = (info.factory)();
                        scope.build_up(instance.as_mut());
                        (info.invoke)(instance.as_mut(), view, ctx)
                    }
                };

                if let Err(source) = result {
                    return Err(DispatchError::Handler {
                        handler: info.handler_name.clone(),
                        message_type: type_name,
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    fn type_name(&self, type_id: std::any::TypeId) -> String {
        self.handlers
            .message_types()
            .name_of(type_id)
            .unwrap_or("<unregistered>")
            .to_string()
    }

    fn on_dispatching(
        &self,
        scope: &dyn ServiceLocator,
        ctx: &MessageContext,
    ) -> Result<(), DispatchError> {
        for manager in &self.unit_of_work_managers {
            manager.begin(scope, ctx)?;
        }
        for observer in &self.observers {
            observer.dispatching(scope, ctx);
        }
        Ok(())
    }

    fn on_dispatched(
        &self,
        scope: &dyn ServiceLocator,
        ctx: &MessageContext,
        error: Option<&DispatchError>,
    ) -> Result<(), DispatchError> {
        let mut end_error = None;
        for manager in &self.unit_of_work_managers {
            if let Err(e) = manager.end(scope, ctx, error) {
                warn!("unit of work end failed: {}", e);
                end_error.get_or_insert(e);
            }
        }
        for observer in &self.observers {
            observer.dispatched(scope, ctx, error);
        }
        match end_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::handler::{HandlerSource, HandlerType, MessageHandler};
    use super::super::locator::BasicServiceLocator;
    use super::super::message_types::MessageTypeRegistry;
    use super::super::registry::HandlerRegistry;
    use super::*;
    use crate::transport::message;
    use std::sync::Mutex;

    // Shared invocation trace: (handler, event).
    type Trace = Arc<Mutex<Vec<String>>>;

    struct FirstMsg {
        trace: Trace,
    }

    struct SecondMsg {
        trace: Trace,
    }

    #[derive(Default)]
    struct RecordingHandler;

    impl MessageHandler<FirstMsg> for RecordingHandler {
        fn handle(&mut self, m: &FirstMsg, _: &MessageContext) -> Result<(), HandlerError> {
            m.trace.lock().unwrap().push("recording:first".to_string());
            Ok(())
        }
    }

    impl MessageHandler<SecondMsg> for RecordingHandler {
        fn handle(&mut self, m: &SecondMsg, _: &MessageContext) -> Result<(), HandlerError> {
            m.trace.lock().unwrap().push("recording:second".to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingHandler;

    impl MessageHandler<SecondMsg> for FailingHandler {
        fn handle(&mut self, m: &SecondMsg, _: &MessageContext) -> Result<(), HandlerError> {
            m.trace.lock().unwrap().push("failing:second".to_string());
            Err(HandlerError::new("boom"))
        }
    }

    struct TracingUow {
        trace: Trace,
    }

    impl UnitOfWorkManager for TracingUow {
        fn begin(
            &self,
            _: &dyn ServiceLocator,
            _: &MessageContext,
        ) -> Result<(), DispatchError> {
            self.trace.lock().unwrap().push("uow:begin".to_string());
            Ok(())
        }

        fn end(
            &self,
            _: &dyn ServiceLocator,
            _: &MessageContext,
            error: Option<&DispatchError>,
        ) -> Result<(), DispatchError> {
            let tag = if error.is_some() {
                "uow:end:err"
            } else {
                "uow:end:ok"
            };
            self.trace.lock().unwrap().push(tag.to_string());
            Ok(())
        }
    }

    fn dispatcher(trace: &Trace) -> MessageDispatcher {
        let mut types = MessageTypeRegistry::new();
        types.register::<FirstMsg>("FirstMsg");
        types.register::<SecondMsg>("SecondMsg");

        let mut registry = HandlerRegistry::new(types);
        registry
            .add_handler_source(
                HandlerSource::new()
                    .handler(
                        HandlerType::<RecordingHandler>::describe("RecordingHandler")
                            .handles::<FirstMsg>()
                            .handles::<SecondMsg>(),
                    )
                    .handler(
                        HandlerType::<FailingHandler>::describe("FailingHandler")
                            .handles::<SecondMsg>(),
                    ),
            )
            .unwrap();
        registry.init();

        MessageDispatcher::new(Arc::new(BasicServiceLocator::new()), Arc::new(registry))
            .with_unit_of_work_manager(Arc::new(TracingUow {
                trace: Arc::clone(trace),
            }))
    }

    #[test]
    fn handlers_for_one_message_run_before_the_next_message() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(&trace);
        let scope = BasicServiceLocator::new();
        let ctx = MessageContext::empty();

        let batch = vec![
            message(FirstMsg {
                trace: Arc::clone(&trace),
            }),
            message(SecondMsg {
                trace: Arc::clone(&trace),
            }),
        ];
        // SecondMsg's failing handler runs after the recording handler and
        // aborts the rest of the batch.
        let batch_with_third = {
            let mut b = batch;
            b.push(message(FirstMsg {
                trace: Arc::clone(&trace),
            }));
            b
        };

        let result = dispatcher.dispatch_messages(&scope, &batch_with_third, &ctx);
        assert!(result.is_err());

        let events = trace.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "uow:begin",
                "recording:first",
                "recording:second",
                "failing:second",
                "uow:end:err",
            ]
        );
    }

    #[test]
    fn successful_batch_runs_end_with_no_error() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(&trace);
        let scope = BasicServiceLocator::new();
        let ctx = MessageContext::empty();

        let batch = vec![message(FirstMsg {
            trace: Arc::clone(&trace),
        })];
        dispatcher.dispatch_messages(&scope, &batch, &ctx).unwrap();

        let events = trace.lock().unwrap().clone();
        assert_eq!(events, vec!["uow:begin", "recording:first", "uow:end:ok"]);
    }

    #[test]
    fn handler_error_carries_handler_and_message_names() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(&trace);
        let scope = BasicServiceLocator::new();
        let ctx = MessageContext::empty();

        let batch = vec![message(SecondMsg {
            trace: Arc::clone(&trace),
        })];
        let error = dispatcher
            .dispatch_messages(&scope, &batch, &ctx)
            .unwrap_err();
        match error {
            DispatchError::Handler {
                handler,
                message_type,
                ..
            } => {
                assert_eq!(handler, "FailingHandler");
                assert_eq!(message_type, "SecondMsg");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn scope_provided_instance_is_used_and_kept() {
        #[derive(Default)]
        struct ScopedHandler {
            invocations: u32,
        }

        impl MessageHandler<FirstMsg> for ScopedHandler {
            fn handle(&mut self, m: &FirstMsg, _: &MessageContext) -> Result<(), HandlerError> {
                self.invocations += 1;
                m.trace
                    .lock()
                    .unwrap()
                    .push(format!("scoped:{}", self.invocations));
                Ok(())
            }
        }

        let mut types = MessageTypeRegistry::new();
        types.register::<FirstMsg>("FirstMsg");
        let mut registry = HandlerRegistry::new(types);
        registry
            .add_handler_source(HandlerSource::new().handler(
                HandlerType::<ScopedHandler>::describe("ScopedHandler").handles::<FirstMsg>(),
            ))
            .unwrap();
        registry.init();

        let dispatcher =
            MessageDispatcher::new(Arc::new(BasicServiceLocator::new()), Arc::new(registry));
        let scope = BasicServiceLocator::new();
        scope.register_instance(ScopedHandler::default());
        let ctx = MessageContext::empty();
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let batch = vec![message(FirstMsg {
                trace: Arc::clone(&trace),
            })];
            dispatcher.dispatch_messages(&scope, &batch, &ctx).unwrap();
        }

        // State accumulated across dispatches proves the scope instance was
        // reused, not default-constructed per invocation.
        let events = trace.lock().unwrap().clone();
        assert_eq!(events, vec!["scoped:1", "scoped:2"]);
    }
}
