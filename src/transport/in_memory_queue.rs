//! An in-process transactional queue backend.
//!
//! Faithful to the behavior of a database-backed queue: rows receive-locked
//! inside a transaction are invisible to concurrent receivers (skip-locked),
//! deleted on commit, and unlocked on rollback. Inserts stay invisible until
//! the transaction commits. Useful for tests and single-process deployments.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::envelope::WireMessage;
use super::queue::{MessageQueue, TransactionToken, TransactionWrapper, TransportError};

thread_local! {
    // The transaction the current thread is inside, if any. Nested
    // run_in_transaction calls join it instead of opening their own.
    static CURRENT_TX: Cell<Option<u64>> = Cell::new(None);
}

struct QueueRow {
    row_id: u64,
    wire: WireMessage,
    locked_by: Option<u64>,
}

#[derive(Default)]
struct TxState {
    /// Rows receive-locked by this transaction: (queue, row_id).
    locked: Vec<(String, u64)>,
    /// Inserts staged until commit: (destination, row).
    inserts: Vec<(String, WireMessage)>,
}

#[derive(Default)]
struct QueueState {
    queues: Mutex<HashMap<String, Vec<QueueRow>>>,
    transactions: Mutex<HashMap<u64, TxState>>,
    next_tx_id: AtomicU64,
    next_row_id: AtomicU64,
}

/// In-memory implementation of [`MessageQueue`] and [`TransactionWrapper`].
///
/// Clones share the same underlying queues, so one instance can serve as
/// both ends of a conversation between two buses in the same process.
#[derive(Clone, Default)]
pub struct InMemoryTransactionalQueue {
    inner: Arc<QueueState>,
}

impl InMemoryTransactionalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row outside any transaction, immediately visible. Test and
    /// seeding helper.
    pub fn enqueue(&self, destination: &str, wire: WireMessage) {
        let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(destination.to_string())
            .or_default()
            .push(QueueRow {
                row_id: self.inner.next_row_id.fetch_add(1, Ordering::SeqCst),
                wire,
                locked_by: None,
            });
    }

    /// Number of committed rows currently in a queue (locked rows included).
    pub fn len(&self, queue: &str) -> usize {
        let queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.get(queue).map_or(0, |rows| rows.len())
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Snapshot the rows of a queue in order. Test helper.
    pub fn rows(&self, queue: &str) -> Vec<WireMessage> {
        let queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .get(queue)
            .map(|rows| rows.iter().map(|r| r.wire.clone()).collect())
            .unwrap_or_default()
    }

    fn commit(&self, tx_id: u64) {
        let state = self
            .inner
            .transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&tx_id)
            .unwrap_or_default();
        let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        for (queue, row_id) in state.locked {
            if let Some(rows) = queues.get_mut(&queue) {
                rows.retain(|r| r.row_id != row_id);
            }
        }
        for (destination, wire) in state.inserts {
            queues.entry(destination).or_default().push(QueueRow {
                row_id: self.inner.next_row_id.fetch_add(1, Ordering::SeqCst),
                wire,
                locked_by: None,
            });
        }
    }

    fn rollback(&self, tx_id: u64) {
        let state = self
            .inner
            .transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&tx_id)
            .unwrap_or_default();
        let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        for (queue, row_id) in state.locked {
            if let Some(rows) = queues.get_mut(&queue) {
                if let Some(row) = rows.iter_mut().find(|r| r.row_id == row_id) {
                    row.locked_by = None;
                }
            }
        }
        // Staged inserts are simply discarded.
    }
}

impl TransactionWrapper for InMemoryTransactionalQueue {
    fn run_in_transaction(
        &self,
        callback: &mut dyn FnMut(&TransactionToken) -> Result<(), TransportError>,
    ) -> Result<(), TransportError> {
        if let Some(outer) = CURRENT_TX.with(|c| c.get()) {
            // Already inside a transaction on this thread: join it and let
            // the outermost scope decide the outcome.
            return callback(&TransactionToken::new(outer));
        }

        let tx_id = self.inner.next_tx_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tx_id, TxState::default());
        CURRENT_TX.with(|c| c.set(Some(tx_id)));

        let result = callback(&TransactionToken::new(tx_id));

        CURRENT_TX.with(|c| c.set(None));
        match result {
            Ok(()) => {
                self.commit(tx_id);
                Ok(())
            }
            Err(e) => {
                self.rollback(tx_id);
                Err(e)
            }
        }
    }
}

impl MessageQueue for InMemoryTransactionalQueue {
    fn start(&self, listener_queue: &str) -> Result<(), TransportError> {
        let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.entry(listener_queue.to_string()).or_default();
        Ok(())
    }

    fn receive_one_locked(
        &self,
        tx: &TransactionToken,
        queue: &str,
    ) -> Result<Option<WireMessage>, TransportError> {
        let mut transactions = self
            .inner
            .transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let state = transactions
            .get_mut(&tx.id())
            .ok_or_else(|| TransportError::Queue(format!("unknown transaction {}", tx.id())))?;

        let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        let rows = match queues.get_mut(queue) {
            Some(rows) => rows,
            None => return Ok(None),
        };
        // Oldest unlocked row wins; locked rows are skipped, not waited on.
        for row in rows.iter_mut() {
            if row.locked_by.is_none() {
                row.locked_by = Some(tx.id());
                state.locked.push((queue.to_string(), row.row_id));
                return Ok(Some(row.wire.clone()));
            }
        }
        Ok(None)
    }

    fn insert_one(
        &self,
        tx: &TransactionToken,
        destination: &str,
        wire: &WireMessage,
    ) -> Result<(), TransportError> {
        let mut transactions = self
            .inner
            .transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let state = transactions
            .get_mut(&tx.id())
            .ok_or_else(|| TransportError::Queue(format!("unknown transaction {}", tx.id())))?;
        state.inserts.push((destination.to_string(), wire.clone()));
        Ok(())
    }
}
