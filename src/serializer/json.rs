//! JSON body codec backed by an explicit type registry.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{MessageSerializer, SerializationError};
use crate::transport::DynMessage;

type EncodeFn = Arc<dyn Fn(&dyn Any) -> Result<serde_json::Value, SerializationError> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&serde_json::Value) -> Result<DynMessage, SerializationError> + Send + Sync>;

#[derive(Serialize, Deserialize)]
struct WireEntry {
    #[serde(rename = "type")]
    type_name: String,
    payload: serde_json::Value,
}

struct Codec {
    name: String,
    encode: EncodeFn,
}

/// A [`MessageSerializer`] writing each message as
/// `{"type": <registered name>, "payload": <serde value>}` inside a JSON
/// array. Every sendable or receivable type must be registered under a
/// stable wire name before the bus starts.
#[derive(Default)]
pub struct JsonMessageSerializer {
    by_type: HashMap<TypeId, Codec>,
    by_name: HashMap<String, DecodeFn>,
}

impl JsonMessageSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type under its wire name.
    pub fn register<M>(&mut self, name: &str)
    where
        M: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        let encode: EncodeFn = Arc::new(|any: &dyn Any| {
            let message = any
                .downcast_ref::<M>()
                .ok_or_else(|| SerializationError::Malformed("codec type mismatch".to_string()))?;
            serde_json::to_value(message)
                .map_err(|e| SerializationError::Malformed(e.to_string()))
        });
        let decode: DecodeFn = Arc::new(|value: &serde_json::Value| {
            let message: M = serde_json::from_value(value.clone())
                .map_err(|e| SerializationError::Malformed(e.to_string()))?;
            Ok(Arc::new(message) as DynMessage)
        });
        self.by_type.insert(
            TypeId::of::<M>(),
            Codec {
                name: name.to_string(),
                encode,
            },
        );
        self.by_name.insert(name.to_string(), decode);
    }
}

impl MessageSerializer for JsonMessageSerializer {
    fn serialize(&self, messages: &[DynMessage]) -> Result<Vec<u8>, SerializationError> {
        let mut entries = Vec::with_capacity(messages.len());
        for message in messages {
            let type_id = (**message).type_id();
            let codec = self.by_type.get(&type_id).ok_or_else(|| {
                SerializationError::UnregisteredType(format!("{type_id:?}"))
            })?;
            entries.push(WireEntry {
                type_name: codec.name.clone(),
                payload: (codec.encode)(message.as_ref())?,
            });
        }
        serde_json::to_vec(&entries).map_err(|e| SerializationError::Malformed(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<DynMessage>, SerializationError> {
        let entries: Vec<WireEntry> = serde_json::from_slice(bytes)
            .map_err(|e| SerializationError::Malformed(e.to_string()))?;
        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            let decode = self
                .by_name
                .get(&entry.type_name)
                .ok_or_else(|| SerializationError::UnknownTypeName(entry.type_name.clone()))?;
            messages.push(decode(&entry.payload)?);
        }
        Ok(messages)
    }
}
