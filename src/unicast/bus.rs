//! The unicast bus: the send/publish/subscribe facade over the transport
//! and the dispatcher.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::context::MessageContext;
use super::subscription::SubscriptionStorage;
use crate::dispatch::MessageDispatcher;
use crate::transport::{
    DynMessage, HeaderInfo, MessageIntent, TransactionalTransport, TransportError,
    TransportMessage, TransportObserver, WorkerControl,
};

/// Header naming the message type a subscription control message is about.
pub const SUBSCRIPTION_MESSAGE_TYPE_HEADER: &str = "unibus.subscription-message-type";

/// Why a bus-level send operation failed.
#[derive(Debug)]
pub enum SendError {
    /// The message set was empty; an envelope must carry at least one
    /// message.
    EmptyMessageSet,
    /// No destination is mapped for the message type or any of its parents.
    NoDestination(String),
    /// The message type was never registered with the message type table.
    UnregisteredMessageType(String),
    /// Publish or subscribe was attempted without subscription storage.
    NoSubscriptionStorage,
    /// Reply was attempted for a message that carried no return address.
    NoReturnAddress,
    Transport(TransportError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::EmptyMessageSet => write!(f, "cannot send an empty message set"),
            SendError::NoDestination(name) => {
                write!(f, "no destination configured for message type {}", name)
            }
            SendError::UnregisteredMessageType(name) => {
                write!(f, "message type {} is not registered", name)
            }
            SendError::NoSubscriptionStorage => {
                write!(f, "no subscription storage is configured")
            }
            SendError::NoReturnAddress => {
                write!(f, "cannot reply: the incoming message has no return address")
            }
            SendError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl Error for SendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SendError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for SendError {
    fn from(e: TransportError) -> Self {
        SendError::Transport(e)
    }
}

/// Observes bus-level message traffic. Hooks run synchronously on the
/// calling thread (`message_sent`) or the worker thread (the rest).
pub trait BusObserver: Send + Sync {
    fn message_sent(&self, _destination: &str, _message_id: &str) {}
    fn message_received(&self, _envelope: &TransportMessage) {}
    fn message_handled(&self, _envelope: &TransportMessage, _elapsed: Duration) {}
    fn message_failed(&self, _envelope: &TransportMessage, _error: &TransportError) {}
}

/// Point-to-point and publish/subscribe messaging over one input queue.
///
/// The bus is the transport's lifecycle observer: received envelopes are
/// either subscription control messages (which mutate subscription storage
/// directly) or dispatched to handlers in a fresh child scope.
pub struct UnicastMessageBus {
    transport: Arc<TransactionalTransport>,
    dispatcher: Arc<MessageDispatcher>,
    local_address: String,
    destinations: RwLock<HashMap<TypeId, String>>,
    subscription_storage: Option<Arc<dyn SubscriptionStorage>>,
    outgoing_headers: RwLock<Vec<HeaderInfo>>,
    observers: RwLock<Vec<Arc<dyn BusObserver>>>,
    started: AtomicBool,
}

impl UnicastMessageBus {
    pub(crate) fn new(
        transport: Arc<TransactionalTransport>,
        dispatcher: Arc<MessageDispatcher>,
        local_address: String,
        destinations: HashMap<TypeId, String>,
        subscription_storage: Option<Arc<dyn SubscriptionStorage>>,
        observers: Vec<Arc<dyn BusObserver>>,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            local_address,
            destinations: RwLock::new(destinations),
            subscription_storage,
            outgoing_headers: RwLock::new(Vec::new()),
            observers: RwLock::new(observers),
            started: AtomicBool::new(false),
        }
    }

    /// Register as the transport's observer and start receiving from the
    /// local queue. Calling `start` on a running bus is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport
            .add_observer(Arc::clone(self) as Arc<dyn TransportObserver>);
        self.transport.start(&self.local_address)?;
        info!("bus started on {}", self.local_address);
        Ok(())
    }

    /// Register a traffic observer.
    pub fn add_observer(&self, observer: Arc<dyn BusObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn stop(&self) {
        self.transport.stop();
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn transport(&self) -> &Arc<TransactionalTransport> {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Stamp a header onto every envelope this bus sends from now on.
    pub fn set_outgoing_header(&self, key: impl Into<String>, value: impl Into<String>) {
        self.outgoing_headers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(HeaderInfo::new(key, value));
    }

    pub fn clear_outgoing_headers(&self) {
        self.outgoing_headers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Send a message set to the destination mapped for the first message's
    /// type. Returns the assigned envelope id.
    pub fn send(&self, messages: Vec<DynMessage>) -> Result<String, SendError> {
        let first = messages.first().ok_or(SendError::EmptyMessageSet)?;
        let destination = self.destination_for((**first).type_id())?;
        self.send_to(&destination, messages)
    }

    /// Send a message set to an explicit destination queue.
    pub fn send_to(
        &self,
        destination: &str,
        messages: Vec<DynMessage>,
    ) -> Result<String, SendError> {
        if messages.is_empty() {
            return Err(SendError::EmptyMessageSet);
        }
        let envelope = self.envelope(MessageIntent::Send, messages);
        let id = self.transport.send(&envelope, destination)?;
        self.notify_sent(destination, &id);
        Ok(id)
    }

    /// Send a message set to an explicit destination with an explicit
    /// correlation id, for callers continuing a conversation outside a
    /// handler.
    pub fn send_correlated(
        &self,
        destination: &str,
        correlation_id: &str,
        messages: Vec<DynMessage>,
    ) -> Result<String, SendError> {
        if messages.is_empty() {
            return Err(SendError::EmptyMessageSet);
        }
        let mut envelope = self.envelope(MessageIntent::Send, messages);
        envelope.correlation_id = Some(correlation_id.to_string());
        let id = self.transport.send(&envelope, destination)?;
        self.notify_sent(destination, &id);
        Ok(id)
    }

    /// Send like [`send`](Self::send), additionally stamping the context's
    /// outgoing headers. For sends made while handling a message.
    pub fn send_from(
        &self,
        ctx: &MessageContext,
        messages: Vec<DynMessage>,
    ) -> Result<String, SendError> {
        let first = messages.first().ok_or(SendError::EmptyMessageSet)?;
        let destination = self.destination_for((**first).type_id())?;
        let mut envelope = self.envelope(MessageIntent::Send, messages);
        envelope.headers.extend(ctx.outgoing_headers());
        let id = self.transport.send(&envelope, &destination)?;
        self.notify_sent(&destination, &id);
        Ok(id)
    }

    /// Reply to the message currently being handled. The outgoing envelope
    /// is correlated to the incoming message's stable identity.
    pub fn reply(
        &self,
        ctx: &MessageContext,
        messages: Vec<DynMessage>,
    ) -> Result<String, SendError> {
        if messages.is_empty() {
            return Err(SendError::EmptyMessageSet);
        }
        if ctx.return_address().is_empty() {
            return Err(SendError::NoReturnAddress);
        }
        let mut envelope = self.envelope(MessageIntent::Send, messages);
        envelope.correlation_id = Some(ctx.id_for_correlation().to_string());
        envelope.headers.extend(ctx.outgoing_headers());
        let id = self.transport.send(&envelope, ctx.return_address())?;
        self.notify_sent(ctx.return_address(), &id);
        Ok(id)
    }

    /// Publish a message set to every subscriber of any of its types (or
    /// their parents). Zero subscribers is a no-op.
    pub fn publish(&self, messages: Vec<DynMessage>) -> Result<(), SendError> {
        if messages.is_empty() {
            return Err(SendError::EmptyMessageSet);
        }
        let storage = self
            .subscription_storage
            .as_ref()
            .ok_or(SendError::NoSubscriptionStorage)?;

        let names = self.closure_names(&messages);
        let subscribers = storage.subscribers_for(&names);
        if subscribers.is_empty() {
            debug!("no subscribers for {:?}, publish is a no-op", names);
            return Ok(());
        }
        let envelope = self.envelope(MessageIntent::Publish, messages);
        let destinations: Vec<&str> = subscribers.iter().map(String::as_str).collect();
        let id = self.transport.send_many(&envelope, &destinations)?;
        for destination in &destinations {
            self.notify_sent(destination, &id);
        }
        Ok(())
    }

    /// Subscribe this endpoint to a message type at the endpoint its route
    /// points to.
    pub fn subscribe<M: Any>(&self) -> Result<(), SendError> {
        self.send_subscription::<M>(MessageIntent::Subscribe, None)
    }

    /// Subscribe at an explicit publisher queue, bypassing the route table.
    pub fn subscribe_to<M: Any>(&self, publisher: &str) -> Result<(), SendError> {
        self.send_subscription::<M>(MessageIntent::Subscribe, Some(publisher))
    }

    pub fn unsubscribe<M: Any>(&self) -> Result<(), SendError> {
        self.send_subscription::<M>(MessageIntent::Unsubscribe, None)
    }

    pub fn unsubscribe_from<M: Any>(&self, publisher: &str) -> Result<(), SendError> {
        self.send_subscription::<M>(MessageIntent::Unsubscribe, Some(publisher))
    }

    fn send_subscription<M: Any>(
        &self,
        intent: MessageIntent,
        publisher: Option<&str>,
    ) -> Result<(), SendError> {
        let type_id = TypeId::of::<M>();
        let name = self
            .message_type_name(type_id)
            .ok_or_else(|| SendError::UnregisteredMessageType(type_label::<M>()))?;
        let destination = match publisher {
            Some(queue) => queue.to_string(),
            None => self.destination_for(type_id)?,
        };

        let mut envelope = self.envelope(intent, Vec::new());
        envelope.set_header(SUBSCRIPTION_MESSAGE_TYPE_HEADER, name);
        let id = self.transport.send(&envelope, &destination)?;
        self.notify_sent(&destination, &id);
        Ok(())
    }

    /// Map a message type to a destination queue at runtime, as
    /// [`MessageBusBuilder::route`](super::MessageBusBuilder::route) does at
    /// build time.
    pub fn map_message_type_to_address<M: Any>(&self, address: impl Into<String>) {
        self.destinations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(TypeId::of::<M>(), address.into());
    }

    fn bus_observers(&self) -> Vec<Arc<dyn BusObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn notify_sent(&self, destination: &str, message_id: &str) {
        for observer in self.bus_observers() {
            observer.message_sent(destination, message_id);
        }
    }

    fn envelope(&self, intent: MessageIntent, messages: Vec<DynMessage>) -> TransportMessage {
        let mut envelope = TransportMessage::new(intent, messages);
        envelope.return_address = self.local_address.clone();
        // Bus-level headers are copied, not referenced: later changes do
        // not affect envelopes already built.
        envelope.headers.extend(
            self.outgoing_headers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned(),
        );
        envelope
    }

    /// The destination for a message type, falling back to the closest
    /// registered parent type.
    fn destination_for(&self, type_id: TypeId) -> Result<String, SendError> {
        let destinations = self.destinations.read().unwrap_or_else(|e| e.into_inner());
        for candidate in self.message_types().closure_of(type_id) {
            if let Some(destination) = destinations.get(&candidate) {
                return Ok(destination.clone());
            }
        }
        Err(SendError::NoDestination(
            self.message_type_name(type_id)
                .unwrap_or_else(|| "<unregistered>".to_string()),
        ))
    }

    fn closure_names(&self, messages: &[DynMessage]) -> Vec<String> {
        let mut names = Vec::new();
        for message in messages {
            for type_id in self.message_types().closure_of((**message).type_id()) {
                if let Some(name) = self.message_type_name(type_id) {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        names
    }

    fn message_type_name(&self, type_id: TypeId) -> Option<String> {
        self.message_types().name_of(type_id).map(str::to_string)
    }

    fn message_types(&self) -> &crate::dispatch::MessageTypeRegistry {
        self.dispatcher.handlers().message_types()
    }

    fn handle_subscription(
        &self,
        envelope: &TransportMessage,
        subscribe: bool,
    ) -> Result<(), TransportError> {
        // Control messages are consumed either way: without storage the
        // request is dropped, not rolled back, so it cannot be retried
        // into the poison store.
        let storage = match self.subscription_storage.as_ref() {
            Some(storage) => storage,
            None => {
                warn!(
                    "subscription message {} received but no subscription storage is configured, dropping it",
                    envelope.id
                );
                return Ok(());
            }
        };
        let type_name = envelope
            .header(SUBSCRIPTION_MESSAGE_TYPE_HEADER)
            .ok_or_else(|| {
                TransportError::Hook("subscription message carries no message type".to_string())
            })?;
        let subscriber = &envelope.return_address;
        if subscriber.is_empty() {
            return Err(TransportError::Hook(
                "subscription message carries no return address".to_string(),
            ));
        }

        let types = [type_name.to_string()];
        if subscribe {
            info!("{} subscribed to {}", subscriber, type_name);
            storage.subscribe(subscriber, &types);
        } else {
            info!("{} unsubscribed from {}", subscriber, type_name);
            storage.unsubscribe(subscriber, &types);
        }
        Ok(())
    }
}

impl TransportObserver for UnicastMessageBus {
    fn message_received(
        &self,
        envelope: &TransportMessage,
        control: &WorkerControl,
    ) -> Result<(), TransportError> {
        match envelope.intent {
            // Control messages mutate subscription storage and are never
            // dispatched to handlers.
            MessageIntent::Subscribe => self.handle_subscription(envelope, true),
            MessageIntent::Unsubscribe => self.handle_subscription(envelope, false),
            _ => {
                debug!(
                    "received message {} from {}",
                    envelope.id, envelope.return_address
                );
                if envelope.body.is_empty() {
                    warn!("message {} carries no body, nothing to dispatch", envelope.id);
                    return Ok(());
                }
                for observer in self.bus_observers() {
                    observer.message_received(envelope);
                }
                let handling_started = Instant::now();
                let scope = self.dispatcher.service_locator().child();
                let ctx = MessageContext::from_envelope(envelope, control);
                match self
                    .dispatcher
                    .dispatch_messages(scope.as_ref(), &envelope.body, &ctx)
                {
                    Ok(()) => {
                        for observer in self.bus_observers() {
                            observer.message_handled(envelope, handling_started.elapsed());
                        }
                        Ok(())
                    }
                    Err(e) => {
                        let error = TransportError::from(e);
                        for observer in self.bus_observers() {
                            observer.message_failed(envelope, &error);
                        }
                        Err(error)
                    }
                }
            }
        }
    }
}

fn type_label<M>() -> String {
    std::any::type_name::<M>()
        .rsplit("::")
        .next()
        .unwrap_or("<unknown>")
        .to_string()
}
