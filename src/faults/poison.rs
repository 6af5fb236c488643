//! The poison message store: the audit trail for permanently failed rows.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::transport::{TransportError, WireMessage};

/// A permanently failed wire row, preserved byte for byte so it can be
/// inspected or replayed manually.
#[derive(Debug, Clone)]
pub struct PoisonMessageRecord {
    /// The queue the row was received from.
    pub queue: String,
    pub inserted_at: SystemTime,
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub reply_to_address: String,
    pub intent: u8,
    /// Serialized header list, exactly as received.
    pub headers: Vec<u8>,
    /// Serialized body, exactly as received.
    pub body: Vec<u8>,
    /// The last handling error, if one was recorded.
    pub error: Option<String>,
}

impl PoisonMessageRecord {
    pub fn from_wire(queue: &str, wire: &WireMessage, error: Option<String>) -> Self {
        Self {
            queue: queue.to_string(),
            inserted_at: SystemTime::now(),
            message_id: wire.id.clone(),
            correlation_id: wire.correlation_id.clone(),
            reply_to_address: wire.reply_to_address.clone(),
            intent: wire.intent,
            headers: wire.headers.clone(),
            body: wire.body.clone(),
            error,
        }
    }
}

/// Durable storage for poison records. The write happens inside the same
/// transaction that removes the row from its queue, so the row moves rather
/// than disappears.
pub trait PoisonMessageStore: Send + Sync {
    fn store(&self, record: PoisonMessageRecord) -> Result<(), TransportError>;
}

/// In-memory [`PoisonMessageStore`]; clones share the same records.
#[derive(Clone, Default)]
pub struct InMemoryPoisonStore {
    records: Arc<Mutex<Vec<PoisonMessageRecord>>>,
}

impl InMemoryPoisonStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PoisonMessageRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl PoisonMessageStore for InMemoryPoisonStore {
    fn store(&self, record: PoisonMessageRecord) -> Result<(), TransportError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_preserves_the_wire_row() {
        let wire = WireMessage {
            id: "m1".to_string(),
            correlation_id: Some("c1".to_string()),
            reply_to_address: "sender".to_string(),
            intent: 1,
            headers: b"[]".to_vec(),
            body: b"payload".to_vec(),
        };

        let store = InMemoryPoisonStore::new();
        store
            .store(PoisonMessageRecord::from_wire(
                "orders",
                &wire,
                Some("boom".to_string()),
            ))
            .unwrap();

        let records = store.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.queue, "orders");
        assert_eq!(record.message_id, "m1");
        assert_eq!(record.correlation_id.as_deref(), Some("c1"));
        assert_eq!(record.intent, 1);
        assert_eq!(record.body, b"payload");
        assert_eq!(record.error.as_deref(), Some("boom"));
    }
}
