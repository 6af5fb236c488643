//! Publish/subscribe between two endpoints, including subscriptions taken
//! out against a parent message type.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use unibus::unicast::{InMemorySubscriptionStorage, MessageContext, SubscriptionStorage};
use unibus::{
    message, BasicServiceLocator, HandlerError, HandlerSource, HandlerType,
    InMemoryPoisonStore, InMemoryTransactionalQueue, MessageBusBuilder, MessageHandler,
    MessageQueue, MessageTypeRegistry, PoisonMessageStore, ServiceLocator, TransactionWrapper,
    UnicastMessageBus,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderEvent {
    order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderShipped {
    event: OrderEvent,
    carrier: String,
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn message_types() -> MessageTypeRegistry {
    let mut types = MessageTypeRegistry::new();
    types.register::<OrderEvent>("OrderEvent");
    types
        .register::<OrderShipped>("OrderShipped")
        .with_parent::<OrderEvent>(|m| &m.event);
    types
}

type Events = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct OrderEventHandler {
    events: Option<Events>,
}

impl MessageHandler<OrderEvent> for OrderEventHandler {
    fn handle(&mut self, m: &OrderEvent, _: &MessageContext) -> Result<(), HandlerError> {
        let events = self
            .events
            .as_ref()
            .ok_or_else(|| HandlerError::new("handler was not given a sink"))?;
        events.lock().unwrap().push(m.order_id.clone());
        Ok(())
    }
}

struct PubSubFixture {
    publisher: Arc<UnicastMessageBus>,
    subscriber: Arc<UnicastMessageBus>,
    storage: Arc<InMemorySubscriptionStorage>,
    queue: InMemoryTransactionalQueue,
    events: Events,
}

fn fixture() -> PubSubFixture {
    let queue = InMemoryTransactionalQueue::new();
    let storage = Arc::new(InMemorySubscriptionStorage::new());

    let publisher = MessageBusBuilder::new("events")
        .with_message_types(message_types())
        .register_message_codec::<OrderEvent>("OrderEvent")
        .register_message_codec::<OrderShipped>("OrderShipped")
        .with_queue(
            Arc::new(queue.clone()) as Arc<dyn MessageQueue>,
            Arc::new(queue.clone()) as Arc<dyn TransactionWrapper>,
        )
        .with_subscription_storage(Arc::clone(&storage) as Arc<dyn SubscriptionStorage>)
        .build()
        .unwrap();
    publisher.start().unwrap();

    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let locator = Arc::new(BasicServiceLocator::new());
    let subscriber = MessageBusBuilder::new("subscriber")
        .with_message_types(message_types())
        .with_handler_source(HandlerSource::new().handler(
            HandlerType::<OrderEventHandler>::describe("OrderEventHandler")
                .handles::<OrderEvent>(),
        ))
        .with_service_locator(Arc::clone(&locator) as Arc<dyn ServiceLocator>)
        .register_message_codec::<OrderEvent>("OrderEvent")
        .register_message_codec::<OrderShipped>("OrderShipped")
        .route::<OrderEvent>("events")
        .with_queue(
            Arc::new(queue.clone()) as Arc<dyn MessageQueue>,
            Arc::new(queue.clone()) as Arc<dyn TransactionWrapper>,
        )
        .build()
        .unwrap();
    locator.register_instance(OrderEventHandler {
        events: Some(Arc::clone(&events)),
    });
    subscriber.start().unwrap();

    PubSubFixture {
        publisher,
        subscriber,
        storage,
        queue,
        events,
    }
}

#[test]
fn publish_reaches_a_subscriber_of_a_parent_type() {
    let fixture = fixture();

    // Zero subscribers: publishing is a no-op, nothing is enqueued.
    fixture
        .publisher
        .publish(vec![message(OrderEvent {
            order_id: "before".to_string(),
        })])
        .unwrap();
    assert!(fixture.queue.is_empty("subscriber"));

    fixture.subscriber.subscribe::<OrderEvent>().unwrap();
    wait_until("the subscription", || {
        !fixture
            .storage
            .subscribers_for(&["OrderEvent".to_string()])
            .is_empty()
    });

    // A derived event reaches the parent-type subscriber, and the handler
    // targeting the parent type sees the projected view.
    fixture
        .publisher
        .publish(vec![message(OrderShipped {
            event: OrderEvent {
                order_id: "ord-9".to_string(),
            },
            carrier: "acme freight".to_string(),
        })])
        .unwrap();

    wait_until("the event", || !fixture.events.lock().unwrap().is_empty());
    assert_eq!(*fixture.events.lock().unwrap(), ["ord-9"]);

    fixture.subscriber.stop();
    fixture.publisher.stop();
}

#[test]
fn subscription_without_storage_is_dropped_not_poisoned() {
    let queue = InMemoryTransactionalQueue::new();
    let poison = InMemoryPoisonStore::new();

    // A publisher endpoint with no subscription storage configured.
    let publisher = MessageBusBuilder::new("events")
        .with_message_types(message_types())
        .register_message_codec::<OrderEvent>("OrderEvent")
        .with_queue(
            Arc::new(queue.clone()) as Arc<dyn MessageQueue>,
            Arc::new(queue.clone()) as Arc<dyn TransactionWrapper>,
        )
        .with_poison_store(Arc::new(poison.clone()) as Arc<dyn PoisonMessageStore>)
        .build()
        .unwrap();
    publisher.start().unwrap();

    let client = MessageBusBuilder::new("client")
        .with_message_types(message_types())
        .register_message_codec::<OrderEvent>("OrderEvent")
        .with_queue(
            Arc::new(queue.clone()) as Arc<dyn MessageQueue>,
            Arc::new(queue.clone()) as Arc<dyn TransactionWrapper>,
        )
        .build()
        .unwrap();
    client.subscribe_to::<OrderEvent>("events").unwrap();

    wait_until("the control message to drain", || queue.is_empty("events"));
    publisher.stop();

    // The request is logged and consumed, never retried into the poison
    // store.
    assert!(poison.records().is_empty());
    assert!(queue.is_empty("events"));
}

#[test]
fn unsubscribe_stops_delivery() {
    let fixture = fixture();

    fixture.subscriber.subscribe::<OrderEvent>().unwrap();
    wait_until("the subscription", || {
        !fixture
            .storage
            .subscribers_for(&["OrderEvent".to_string()])
            .is_empty()
    });

    fixture
        .publisher
        .publish(vec![message(OrderEvent {
            order_id: "ord-1".to_string(),
        })])
        .unwrap();
    wait_until("the first event", || {
        !fixture.events.lock().unwrap().is_empty()
    });

    fixture.subscriber.unsubscribe::<OrderEvent>().unwrap();
    wait_until("the unsubscription", || {
        fixture
            .storage
            .subscribers_for(&["OrderEvent".to_string()])
            .is_empty()
    });

    // With no subscribers left the publish sends nothing at all.
    fixture
        .publisher
        .publish(vec![message(OrderEvent {
            order_id: "ord-2".to_string(),
        })])
        .unwrap();
    assert!(fixture.queue.is_empty("subscriber"));
    assert_eq!(*fixture.events.lock().unwrap(), ["ord-1"]);

    fixture.subscriber.stop();
    fixture.publisher.stop();
}
