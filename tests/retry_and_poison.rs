//! Retry bookkeeping and the poison path, exercised through the bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use unibus::unicast::MessageContext;
use unibus::{
    message, BasicServiceLocator, HandlerError, HandlerSource, HandlerType, InMemoryPoisonStore,
    InMemoryTransactionalQueue, MessageBusBuilder, MessageHandler, MessageQueue,
    MessageTypeRegistry, ServiceLocator, TransactionWrapper, UnicastMessageBus,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChargeCard {
    amount: u32,
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

#[derive(Default)]
struct FlakyHandler {
    // Fails this many deliveries before succeeding.
    failures_left: Option<Arc<AtomicUsize>>,
    deliveries: Option<Arc<AtomicUsize>>,
}

impl MessageHandler<ChargeCard> for FlakyHandler {
    fn handle(&mut self, _: &ChargeCard, _: &MessageContext) -> Result<(), HandlerError> {
        let deliveries = self
            .deliveries
            .as_ref()
            .ok_or_else(|| HandlerError::new("handler was not given counters"))?;
        deliveries.fetch_add(1, Ordering::SeqCst);

        let failures_left = self
            .failures_left
            .as_ref()
            .ok_or_else(|| HandlerError::new("handler was not given counters"))?;
        let left = failures_left.load(Ordering::SeqCst);
        if left > 0 {
            failures_left.store(left - 1, Ordering::SeqCst);
            return Err(HandlerError::new("payment gateway unavailable"));
        }
        Ok(())
    }
}

struct Endpoint {
    bus: Arc<UnicastMessageBus>,
    queue: InMemoryTransactionalQueue,
    poison: InMemoryPoisonStore,
}

fn endpoint(max_retries: u32, register: impl FnOnce(&BasicServiceLocator)) -> Endpoint {
    let queue = InMemoryTransactionalQueue::new();
    let poison = InMemoryPoisonStore::new();
    let locator = Arc::new(BasicServiceLocator::new());

    let mut types = MessageTypeRegistry::new();
    types.register::<ChargeCard>("ChargeCard");

    let bus = MessageBusBuilder::new("payments")
        .with_message_types(types)
        .with_handler_source(HandlerSource::new().handler(
            HandlerType::<FlakyHandler>::describe("FlakyHandler").handles::<ChargeCard>(),
        ))
        .with_service_locator(Arc::clone(&locator) as Arc<dyn ServiceLocator>)
        .register_message_codec::<ChargeCard>("ChargeCard")
        .with_queue(
            Arc::new(queue.clone()) as Arc<dyn MessageQueue>,
            Arc::new(queue.clone()) as Arc<dyn TransactionWrapper>,
        )
        .with_poison_store(Arc::new(poison.clone()))
        .with_max_retries(max_retries)
        .build()
        .unwrap();
    register(&locator);
    bus.start().unwrap();

    Endpoint { bus, queue, poison }
}

#[test]
fn a_message_that_always_fails_is_poisoned_after_the_retry_limit() {
    let deliveries = Arc::new(AtomicUsize::new(0));
    let failures_left = Arc::new(AtomicUsize::new(usize::MAX));
    let endpoint = endpoint(3, |locator| {
        locator.register_instance(FlakyHandler {
            failures_left: Some(Arc::clone(&failures_left)),
            deliveries: Some(Arc::clone(&deliveries)),
        });
    });

    let id = endpoint
        .bus
        .send_to("payments", vec![message(ChargeCard { amount: 100 })])
        .unwrap();

    wait_until("the poison record", || {
        !endpoint.poison.records().is_empty()
    });
    wait_until("the queue drain", || endpoint.queue.is_empty("payments"));
    endpoint.bus.stop();

    // Exactly max_retries dispatch attempts, then one poison write.
    assert_eq!(deliveries.load(Ordering::SeqCst), 3);
    let records = endpoint.poison.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message_id, id);
    assert_eq!(records[0].queue, "payments");
    let error = records[0].error.as_deref().unwrap();
    assert!(error.contains("FlakyHandler"));
    assert!(error.contains("payment gateway unavailable"));
}

#[test]
fn transient_failures_are_retried_until_the_handler_succeeds() {
    let deliveries = Arc::new(AtomicUsize::new(0));
    let failures_left = Arc::new(AtomicUsize::new(2));
    let endpoint = endpoint(5, |locator| {
        locator.register_instance(FlakyHandler {
            failures_left: Some(Arc::clone(&failures_left)),
            deliveries: Some(Arc::clone(&deliveries)),
        });
    });

    endpoint
        .bus
        .send_to("payments", vec![message(ChargeCard { amount: 50 })])
        .unwrap();

    wait_until("the queue drain", || endpoint.queue.is_empty("payments"));
    endpoint.bus.stop();

    assert_eq!(deliveries.load(Ordering::SeqCst), 3);
    assert!(endpoint.poison.records().is_empty());
}

type AbortLog = Arc<Mutex<Vec<&'static str>>>;

#[derive(Default)]
struct AbortOnceHandler {
    log: Option<AbortLog>,
}

impl MessageHandler<ChargeCard> for AbortOnceHandler {
    fn handle(&mut self, _: &ChargeCard, ctx: &MessageContext) -> Result<(), HandlerError> {
        let log = self
            .log
            .as_ref()
            .ok_or_else(|| HandlerError::new("handler was not given a log"))?;
        let mut log = log.lock().unwrap();
        if log.is_empty() {
            log.push("deferred");
            ctx.abort_handling_current_message();
        } else {
            log.push("handled");
        }
        Ok(())
    }
}

#[test]
fn an_aborted_message_is_redelivered_without_counting_a_failure() {
    let log: AbortLog = Arc::new(Mutex::new(Vec::new()));
    let queue = InMemoryTransactionalQueue::new();
    let poison = InMemoryPoisonStore::new();
    let locator = Arc::new(BasicServiceLocator::new());

    let mut types = MessageTypeRegistry::new();
    types.register::<ChargeCard>("ChargeCard");

    // max_retries 1: a single counted failure would poison the message, so
    // the successful redelivery proves the abort was not counted.
    let bus = MessageBusBuilder::new("payments")
        .with_message_types(types)
        .with_handler_source(HandlerSource::new().handler(
            HandlerType::<AbortOnceHandler>::describe("AbortOnceHandler").handles::<ChargeCard>(),
        ))
        .with_service_locator(Arc::clone(&locator) as Arc<dyn ServiceLocator>)
        .register_message_codec::<ChargeCard>("ChargeCard")
        .with_queue(
            Arc::new(queue.clone()) as Arc<dyn MessageQueue>,
            Arc::new(queue.clone()) as Arc<dyn TransactionWrapper>,
        )
        .with_poison_store(Arc::new(poison.clone()))
        .with_max_retries(1)
        .build()
        .unwrap();
    locator.register_instance(AbortOnceHandler {
        log: Some(Arc::clone(&log)),
    });
    bus.start().unwrap();

    bus.send_to("payments", vec![message(ChargeCard { amount: 10 })])
        .unwrap();

    wait_until("the queue drain", || queue.is_empty("payments"));
    bus.stop();

    assert_eq!(*log.lock().unwrap(), ["deferred", "handled"]);
    assert!(poison.records().is_empty());
}
