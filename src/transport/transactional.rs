//! The transactional transport: worker threads receiving from a queue, with
//! retry bookkeeping and a poison path for permanent failures.
//!
//! Each worker iteration runs inside one queue transaction: the physical
//! receive, every outgoing send performed by handlers on the same thread,
//! and any poison-store write all commit or roll back together. A handling
//! failure rolls the row back onto the queue and increments its failure
//! count; once the count reaches the retry limit the row is moved to the
//! poison store instead of being dispatched again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use log::{debug, error, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use super::envelope::{MessageIntent, TransportMessage, WireMessage};
use super::events::{TransportObserver, WorkerControl};
use super::queue::{MessageQueue, TransactionToken, TransactionWrapper, TransportError};
use super::semaphore::Semaphore;
use crate::faults::{
    format_error_chain, FailureReason, PoisonMessageRecord, PoisonMessageStore,
    FAULT_EXCEPTION_HEADER, FAULT_MESSAGE_ID_HEADER, FAULT_REASON_HEADER,
    FAULT_SOURCE_QUEUE_HEADER,
};
use crate::serializer::EnvelopeSerializer;
use crate::transport::HeaderInfo;

const MAX_IDLE_BACKOFF: Duration = Duration::from_millis(250);

struct FailureRecord {
    attempts: u32,
    last_error: Option<String>,
}

struct TransportInner {
    queue: Arc<dyn MessageQueue>,
    transaction_wrapper: Arc<dyn TransactionWrapper>,
    serializer: Arc<EnvelopeSerializer>,
    poison_store: Arc<dyn PoisonMessageStore>,
    observers: RwLock<Vec<Arc<dyn TransportObserver>>>,
    /// Per-message-id retry bookkeeping, keyed by the wire id that stays
    /// stable across redeliveries.
    failures: RwLock<HashMap<String, FailureRecord>>,
    /// Bounds concurrent receive attempts. Acquired before the transaction
    /// opens and released right after the physical receive, so a waiting
    /// worker holds no transaction and handling never holds a permit.
    admission: Semaphore,
    listener_queue: RwLock<String>,
    max_retries: AtomicU32,
    forward_faults_to: RwLock<Option<String>>,
    started: AtomicBool,
}

struct WorkerHandle {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// A message transport backed by a transactional [`MessageQueue`].
pub struct TransactionalTransport {
    inner: Arc<TransportInner>,
    workers: Mutex<Vec<WorkerHandle>>,
    initial_workers: AtomicU32,
}

impl TransactionalTransport {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        transaction_wrapper: Arc<dyn TransactionWrapper>,
        serializer: Arc<EnvelopeSerializer>,
        poison_store: Arc<dyn PoisonMessageStore>,
    ) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                queue,
                transaction_wrapper,
                serializer,
                poison_store,
                observers: RwLock::new(Vec::new()),
                failures: RwLock::new(HashMap::new()),
                admission: Semaphore::new(1),
                listener_queue: RwLock::new(String::new()),
                max_retries: AtomicU32::new(5),
                forward_faults_to: RwLock::new(None),
                started: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
            initial_workers: AtomicU32::new(1),
        }
    }

    /// How many handling failures a message may accumulate before it is
    /// moved to the poison store. Default 5.
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        self.inner.max_retries.store(max_retries, Ordering::SeqCst);
        self
    }

    /// Forward a fault notification envelope to this queue whenever a
    /// message is moved to the poison store.
    pub fn with_forward_faults_to(self, queue: impl Into<String>) -> Self {
        *self
            .inner
            .forward_faults_to
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(queue.into());
        self
    }

    /// Worker thread count to spawn at start. Default 1.
    pub fn with_number_of_worker_threads(self, count: u32) -> Self {
        self.initial_workers.store(count, Ordering::SeqCst);
        self
    }

    /// Register a lifecycle observer. Must happen before `start`.
    pub fn add_observer(&self, observer: Arc<dyn TransportObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Prepare the listener queue and spawn the worker threads. Calling
    /// `start` on a running transport is a no-op.
    pub fn start(&self, listener_queue: &str) -> Result<(), TransportError> {
        if self.inner.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.queue.start(listener_queue)?;
        *self
            .inner
            .listener_queue
            .write()
            .unwrap_or_else(|e| e.into_inner()) = listener_queue.to_string();
        self.inner.started.store(true, Ordering::SeqCst);
        self.change_number_of_worker_threads(self.initial_workers.load(Ordering::SeqCst) as usize);
        debug!(
            "transport started on queue {} with {} worker(s)",
            listener_queue,
            self.worker_count()
        );
        Ok(())
    }

    /// Grow or shrink the worker pool at runtime.
    pub fn change_number_of_worker_threads(&self, target: usize) {
        if !self.inner.started.load(Ordering::SeqCst) {
            self.initial_workers.store(target as u32, Ordering::SeqCst);
            return;
        }
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        while workers.len() < target {
            let index = workers.len();
            workers.push(spawn_worker(Arc::clone(&self.inner), index));
        }
        while workers.len() > target {
            if let Some(worker) = workers.pop() {
                let _ = worker.stop_tx.send(());
                let _ = worker.handle.join();
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop all workers and wait for them to finish their current message.
    pub fn stop(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for worker in workers.iter() {
            let _ = worker.stop_tx.send(());
        }
        for worker in workers.drain(..) {
            let _ = worker.handle.join();
        }
    }

    /// Send an envelope to a destination queue, stamping identity and send
    /// time. Joins the ambient receive transaction when called from a
    /// handler, so sends commit or roll back with the message being handled.
    /// Returns the assigned envelope id.
    pub fn send(
        &self,
        envelope: &TransportMessage,
        destination: &str,
    ) -> Result<String, TransportError> {
        self.send_many(envelope, &[destination])
    }

    /// Send one envelope to several destinations. The body is serialized
    /// once and every insert happens in the same transaction.
    pub fn send_many(
        &self,
        envelope: &TransportMessage,
        destinations: &[&str],
    ) -> Result<String, TransportError> {
        let mut outgoing = envelope.clone();
        outgoing.id = Uuid::new_v4().to_string();
        outgoing.assign_id_for_correlation();
        outgoing.time_sent = Some(SystemTime::now());
        if outgoing.return_address.is_empty() {
            outgoing.return_address = self
                .inner
                .listener_queue
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
        }

        let wire = self.inner.serializer.seal(&outgoing)?;
        self.inner.transaction_wrapper.run_in_transaction(&mut |tx| {
            for destination in destinations {
                self.inner.queue.insert_one(tx, destination, &wire)?;
            }
            Ok(())
        })?;

        debug!("sent message {} to {:?}", outgoing.id, destinations);
        Ok(outgoing.id)
    }

    /// The envelope serializer this transport persists with.
    pub fn serializer(&self) -> &Arc<EnvelopeSerializer> {
        &self.inner.serializer
    }
}

impl Drop for TransactionalTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(inner: Arc<TransportInner>, index: usize) -> WorkerHandle {
    let (stop_tx, stop_rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name(format!("transport-worker-{index}"))
        .spawn(move || worker_loop(inner, stop_rx))
        .unwrap_or_else(|e| panic!("failed to spawn transport worker: {e}"));
    WorkerHandle { stop_tx, handle }
}

fn worker_loop(inner: Arc<TransportInner>, stop_rx: mpsc::Receiver<()>) {
    let mut backoff = Backoff::new(MAX_IDLE_BACKOFF);
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        match inner.process_one() {
            Ok(true) => backoff.reset(),
            Ok(false) => backoff.wait(),
            Err(TransportError::Aborted) => {
                debug!("handling of the current message was aborted, message returned to queue");
                backoff.wait();
            }
            Err(e) => {
                warn!("message processing failed, transaction rolled back: {}", e);
                backoff.wait();
            }
        }
    }
}

impl TransportInner {
    fn listener_queue(&self) -> String {
        self.listener_queue
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn observers(&self) -> Vec<Arc<dyn TransportObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// One worker iteration. `Ok(true)` means a message was received.
    fn process_one(&self) -> Result<bool, TransportError> {
        let queue_name = self.listener_queue();
        let mut received = false;
        self.admission.acquire();
        self.transaction_wrapper.run_in_transaction(&mut |tx| {
            let receive_result = self.queue.receive_one_locked(tx, &queue_name);
            self.admission.release();

            let wire = match receive_result {
                Ok(Some(wire)) => wire,
                Ok(None) => return Ok(()),
                Err(e) => {
                    // A failed receive is indistinguishable from an empty
                    // queue for the loop; the backoff absorbs it.
                    warn!("receive from {} failed: {}", queue_name, e);
                    return Ok(());
                }
            };
            received = true;
            self.process_wire(tx, &queue_name, &wire)
        })?;
        Ok(received)
    }

    fn process_wire(
        &self,
        tx: &TransactionToken,
        queue_name: &str,
        wire: &WireMessage,
    ) -> Result<(), TransportError> {
        let envelope = match self.serializer.open(wire) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Undeserializable rows are permanent failures; retrying
                // cannot help.
                error!("message {} could not be deserialized: {}", wire.id, e);
                self.move_to_poison(
                    tx,
                    queue_name,
                    wire,
                    FailureReason::SerializationFailed,
                    Some(format_error_chain(&e)),
                )?;
                return Ok(());
            }
        };

        if expired(&envelope) {
            debug!("discarding message {}: time to be received elapsed", wire.id);
            return Ok(());
        }

        let control = WorkerControl::new();
        let outcome = self.run_hooks(tx, queue_name, wire, &envelope, &control);

        if control.abort_requested() {
            return Err(TransportError::Aborted);
        }
        if let Err(e) = outcome {
            for observer in self.observers() {
                observer.failed_processing(&e);
            }
            self.record_failure(&wire.id, format_error_chain(&e));
            return Err(e);
        }

        self.clear_failure(&wire.id);
        Ok(())
    }

    /// The started/finished lifecycle brackets both the dispatch pass and,
    /// at the retry ceiling, the poison pass. The ceiling is checked before
    /// `message_received`, so a poisoned message never reaches the dispatch
    /// pipeline again.
    fn run_hooks(
        &self,
        tx: &TransactionToken,
        queue_name: &str,
        wire: &WireMessage,
        envelope: &TransportMessage,
        control: &WorkerControl,
    ) -> Result<(), TransportError> {
        let observers = self.observers();
        for observer in &observers {
            observer.started_processing(envelope, control)?;
        }
        if let Some(last_error) = self.exhausted_retries(&wire.id) {
            error!(
                "message {} failed {} time(s), moving it to the poison store",
                wire.id,
                self.max_retries.load(Ordering::SeqCst)
            );
            self.move_to_poison(tx, queue_name, wire, FailureReason::ProcessingFailed, last_error)?;
            self.clear_failure(&wire.id);
        } else {
            for observer in &observers {
                observer.message_received(envelope, control)?;
            }
        }
        for observer in &observers {
            observer.finished_processing()?;
        }
        Ok(())
    }

    fn move_to_poison(
        &self,
        tx: &TransactionToken,
        queue_name: &str,
        wire: &WireMessage,
        reason: FailureReason,
        last_error: Option<String>,
    ) -> Result<(), TransportError> {
        self.poison_store.store(PoisonMessageRecord::from_wire(
            queue_name,
            wire,
            last_error.clone(),
        ))?;
        for observer in self.observers() {
            observer.message_fault(wire, reason, last_error.as_deref());
        }

        // Fault forwarding is best-effort: a failure here is logged and
        // swallowed so the primary poison write still commits.
        let forward_to = self
            .forward_faults_to
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(fault_queue) = forward_to {
            let fault = fault_row(wire, queue_name, reason, last_error.as_deref());
            if let Err(e) = self.queue.insert_one(tx, &fault_queue, &fault) {
                error!(
                    "failed to forward fault notification for message {} to {}: {}",
                    wire.id, fault_queue, e
                );
            }
        }
        Ok(())
    }

    fn exhausted_retries(&self, message_id: &str) -> Option<Option<String>> {
        let failures = self.failures.read().unwrap_or_else(|e| e.into_inner());
        let record = failures.get(message_id)?;
        if record.attempts >= self.max_retries.load(Ordering::SeqCst) {
            Some(record.last_error.clone())
        } else {
            None
        }
    }

    fn record_failure(&self, message_id: &str, error: String) {
        let mut failures = self.failures.write().unwrap_or_else(|e| e.into_inner());
        let record = failures
            .entry(message_id.to_string())
            .or_insert(FailureRecord {
                attempts: 0,
                last_error: None,
            });
        record.attempts += 1;
        record.last_error = Some(error);
    }

    fn clear_failure(&self, message_id: &str) {
        self.failures
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(message_id);
    }
}

fn expired(envelope: &TransportMessage) -> bool {
    match (envelope.time_sent, envelope.time_to_be_received) {
        (Some(sent), Some(ttbr)) => match sent.elapsed() {
            Ok(age) => age > ttbr,
            Err(_) => false,
        },
        _ => false,
    }
}

/// A fault notification row: the failed payload under a fresh id, correlated
/// to the failed message, with provenance headers.
fn fault_row(
    wire: &WireMessage,
    source_queue: &str,
    reason: FailureReason,
    last_error: Option<&str>,
) -> WireMessage {
    let mut headers =
        crate::serializer::decode_headers(&wire.headers).unwrap_or_default();
    headers.push(HeaderInfo::new(FAULT_REASON_HEADER, reason.to_string()));
    headers.push(HeaderInfo::new(FAULT_MESSAGE_ID_HEADER, wire.id.clone()));
    headers.push(HeaderInfo::new(FAULT_SOURCE_QUEUE_HEADER, source_queue));
    if let Some(error) = last_error {
        headers.push(HeaderInfo::new(FAULT_EXCEPTION_HEADER, error));
    }
    WireMessage {
        id: Uuid::new_v4().to_string(),
        correlation_id: Some(wire.id.clone()),
        reply_to_address: wire.reply_to_address.clone(),
        intent: MessageIntent::FaultNotification.as_u8(),
        headers: crate::serializer::encode_headers(&headers).unwrap_or_default(),
        body: wire.body.clone(),
    }
}
