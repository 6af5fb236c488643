//! One-stop wiring for a bus endpoint.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use super::bus::{BusObserver, UnicastMessageBus};
use super::subscription::SubscriptionStorage;
use crate::dispatch::{
    BasicServiceLocator, DispatchObserver, HandlerRegistry, HandlerSource, MessageDispatcher,
    MessageTypeRegistry, RegistryError, ServiceLocator, UnitOfWorkManager,
};
use crate::faults::{InMemoryPoisonStore, PoisonMessageStore};
use crate::serializer::{EnvelopeSerializer, JsonMessageSerializer, MessageSerializer};
use crate::transport::{
    InMemoryTransactionalQueue, MessageQueue, TransactionWrapper, TransactionalTransport,
};

/// Builds a [`UnicastMessageBus`] with its transport and dispatcher.
///
/// Every component has an in-crate default (in-memory queue, JSON body
/// codec, in-memory poison store, basic service locator); production
/// deployments swap in durable implementations piece by piece.
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use unibus::{
///     HandlerSource, HandlerType, MessageBusBuilder, MessageTypeRegistry,
/// };
/// # use unibus::{HandlerError, MessageHandler};
/// # use unibus::unicast::MessageContext;
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Serialize, Deserialize)]
/// # struct PlaceOrder;
/// # #[derive(Default)]
/// # struct PlaceOrderHandler;
/// # impl MessageHandler<PlaceOrder> for PlaceOrderHandler {
/// #     fn handle(&mut self, _: &PlaceOrder, _: &MessageContext) -> Result<(), HandlerError> {
/// #         Ok(())
/// #     }
/// # }
///
/// let mut types = MessageTypeRegistry::new();
/// types.register::<PlaceOrder>("PlaceOrder");
///
/// let bus = MessageBusBuilder::new("orders")
///     .with_message_types(types)
///     .with_handler_source(HandlerSource::new().handler(
///         HandlerType::<PlaceOrderHandler>::describe("PlaceOrderHandler")
///             .handles::<PlaceOrder>(),
///     ))
///     .register_message_codec::<PlaceOrder>("PlaceOrder")
///     .route::<PlaceOrder>("orders")
///     .build()
///     .unwrap();
/// bus.start().unwrap();
/// ```
pub struct MessageBusBuilder {
    local_address: String,
    message_types: MessageTypeRegistry,
    handler_sources: Vec<HandlerSource>,
    service_locator: Option<Arc<dyn ServiceLocator>>,
    body_serializer: Option<Arc<dyn MessageSerializer>>,
    json_serializer: JsonMessageSerializer,
    queue: Option<Arc<dyn MessageQueue>>,
    transaction_wrapper: Option<Arc<dyn TransactionWrapper>>,
    poison_store: Option<Arc<dyn PoisonMessageStore>>,
    subscription_storage: Option<Arc<dyn SubscriptionStorage>>,
    unit_of_work_managers: Vec<Arc<dyn UnitOfWorkManager>>,
    dispatch_observers: Vec<Arc<dyn DispatchObserver>>,
    bus_observers: Vec<Arc<dyn BusObserver>>,
    routes: Vec<(TypeId, String)>,
    max_retries: Option<u32>,
    worker_threads: Option<u32>,
    forward_faults_to: Option<String>,
}

impl MessageBusBuilder {
    /// Start building an endpoint listening on the given queue.
    pub fn new(local_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            message_types: MessageTypeRegistry::new(),
            handler_sources: Vec::new(),
            service_locator: None,
            body_serializer: None,
            json_serializer: JsonMessageSerializer::new(),
            queue: None,
            transaction_wrapper: None,
            poison_store: None,
            subscription_storage: None,
            unit_of_work_managers: Vec::new(),
            dispatch_observers: Vec::new(),
            bus_observers: Vec::new(),
            routes: Vec::new(),
            max_retries: None,
            worker_threads: None,
            forward_faults_to: None,
        }
    }

    pub fn with_message_types(mut self, message_types: MessageTypeRegistry) -> Self {
        self.message_types = message_types;
        self
    }

    pub fn with_handler_source(mut self, source: HandlerSource) -> Self {
        self.handler_sources.push(source);
        self
    }

    pub fn with_service_locator(mut self, locator: Arc<dyn ServiceLocator>) -> Self {
        self.service_locator = Some(locator);
        self
    }

    /// Replace the default JSON body codec entirely. Codecs registered via
    /// `register_message_codec` are ignored when this is set.
    pub fn with_body_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.body_serializer = Some(serializer);
        self
    }

    /// Register a message type with the default JSON body codec.
    pub fn register_message_codec<M>(mut self, name: &str) -> Self
    where
        M: serde::Serialize + serde::de::DeserializeOwned + Any + Send + Sync,
    {
        self.json_serializer.register::<M>(name);
        self
    }

    /// Use a custom queue backend. Both halves usually come from the same
    /// object, as with [`InMemoryTransactionalQueue`].
    pub fn with_queue(
        mut self,
        queue: Arc<dyn MessageQueue>,
        transaction_wrapper: Arc<dyn TransactionWrapper>,
    ) -> Self {
        self.queue = Some(queue);
        self.transaction_wrapper = Some(transaction_wrapper);
        self
    }

    pub fn with_poison_store(mut self, store: Arc<dyn PoisonMessageStore>) -> Self {
        self.poison_store = Some(store);
        self
    }

    pub fn with_subscription_storage(mut self, storage: Arc<dyn SubscriptionStorage>) -> Self {
        self.subscription_storage = Some(storage);
        self
    }

    pub fn with_unit_of_work_manager(mut self, manager: Arc<dyn UnitOfWorkManager>) -> Self {
        self.unit_of_work_managers.push(manager);
        self
    }

    pub fn with_dispatch_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.dispatch_observers.push(observer);
        self
    }

    pub fn with_bus_observer(mut self, observer: Arc<dyn BusObserver>) -> Self {
        self.bus_observers.push(observer);
        self
    }

    /// Map a message type (and, through the type closure, its descendants)
    /// to a destination queue.
    pub fn route<M: Any>(mut self, destination: impl Into<String>) -> Self {
        self.routes.push((TypeId::of::<M>(), destination.into()));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_worker_threads(mut self, count: u32) -> Self {
        self.worker_threads = Some(count);
        self
    }

    pub fn with_forward_faults_to(mut self, queue: impl Into<String>) -> Self {
        self.forward_faults_to = Some(queue.into());
        self
    }

    /// Wire everything together. The bus still needs `start()` to begin
    /// receiving.
    pub fn build(self) -> Result<Arc<UnicastMessageBus>, RegistryError> {
        let mut registry = HandlerRegistry::new(self.message_types);
        for source in self.handler_sources {
            registry.add_handler_source(source)?;
        }
        registry.init();

        let locator = self
            .service_locator
            .unwrap_or_else(|| Arc::new(BasicServiceLocator::new()));
        let mut dispatcher = MessageDispatcher::new(locator, Arc::new(registry));
        for manager in self.unit_of_work_managers {
            dispatcher = dispatcher.with_unit_of_work_manager(manager);
        }
        for observer in self.dispatch_observers {
            dispatcher = dispatcher.with_observer(observer);
        }

        let (queue, transaction_wrapper) = match (self.queue, self.transaction_wrapper) {
            (Some(queue), Some(wrapper)) => (queue, wrapper),
            _ => {
                let queue = Arc::new(InMemoryTransactionalQueue::new());
                (
                    Arc::clone(&queue) as Arc<dyn MessageQueue>,
                    queue as Arc<dyn TransactionWrapper>,
                )
            }
        };
        let body = self
            .body_serializer
            .unwrap_or_else(|| Arc::new(self.json_serializer));
        let poison_store = self
            .poison_store
            .unwrap_or_else(|| Arc::new(InMemoryPoisonStore::new()));

        let mut transport = TransactionalTransport::new(
            queue,
            transaction_wrapper,
            Arc::new(EnvelopeSerializer::new(body)),
            poison_store,
        );
        if let Some(max_retries) = self.max_retries {
            transport = transport.with_max_retries(max_retries);
        }
        if let Some(count) = self.worker_threads {
            transport = transport.with_number_of_worker_threads(count);
        }
        if let Some(fault_queue) = self.forward_faults_to {
            transport = transport.with_forward_faults_to(fault_queue);
        }

        Ok(Arc::new(UnicastMessageBus::new(
            Arc::new(transport),
            Arc::new(dispatcher),
            self.local_address,
            self.routes.into_iter().collect::<HashMap<_, _>>(),
            self.subscription_storage,
            self.bus_observers,
        )))
    }
}
