//! The handler registry: message-type to handler resolution with
//! deterministic, adjustable ordering.

use std::any::TypeId;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, RwLock};

use super::handler::{HandlerDescriptor, HandlerFactory, HandlerInvoker, HandlerSource};
use super::message_types::{MessageTypeDescriptor, MessageTypeRegistry};

/// Registry misuse: these are programming errors surfaced at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A pre-init operation was attempted after `init()`.
    AlreadyInitialized,
    /// A post-init operation was attempted before `init()`.
    NotInitialized,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyInitialized => {
                write!(f, "handler registry already initialized")
            }
            RegistryError::NotInitialized => {
                write!(f, "handler registry has not been initialized")
            }
        }
    }
}

impl Error for RegistryError {}

/// A resolved (message type, handler type, invoker) dispatch target.
///
/// Immutable once resolved; cached keyed by (handler type, message type).
pub struct DispatchInfo {
    pub message_type: TypeId,
    pub handler_type: TypeId,
    pub handler_name: String,
    pub(crate) invoke: HandlerInvoker,
    pub(crate) factory: HandlerFactory,
}

struct HandlerRecord {
    descriptor: HandlerDescriptor,
}

/// Build-once, read-many mapping from message types to ordered dispatch
/// targets.
///
/// Candidate handlers and message type conventions accumulate before
/// `init()`; after `init()` only the handler-order list (via
/// `execute_these_handlers_first/last`) and the dispatch-info cache mutate.
pub struct HandlerRegistry {
    message_types: MessageTypeRegistry,
    pending: Vec<HandlerDescriptor>,
    records: HashMap<TypeId, HandlerRecord>,
    handler_order: RwLock<Vec<TypeId>>,
    dispatch_cache: RwLock<HashMap<(TypeId, TypeId), Arc<DispatchInfo>>>,
    initialized: bool,
}

impl HandlerRegistry {
    pub fn new(message_types: MessageTypeRegistry) -> Self {
        Self {
            message_types,
            pending: Vec::new(),
            records: HashMap::new(),
            handler_order: RwLock::new(Vec::new()),
            dispatch_cache: RwLock::new(HashMap::new()),
            initialized: false,
        }
    }

    /// The message type table backing resolution and closure walks.
    pub fn message_types(&self) -> &MessageTypeRegistry {
        &self.message_types
    }

    /// Accumulate candidate handler types. Pre-init only.
    pub fn add_handler_source(&mut self, source: HandlerSource) -> Result<(), RegistryError> {
        self.assert_not_init()?;
        self.pending.extend(source.handlers);
        Ok(())
    }

    /// Extend what counts as a "message type". Pre-init only.
    pub fn add_message_type_convention(
        &mut self,
        convention: impl Fn(&MessageTypeDescriptor) -> bool + Send + Sync + 'static,
    ) -> Result<(), RegistryError> {
        self.assert_not_init()?;
        self.message_types.add_convention(convention);
        Ok(())
    }

    /// Freeze the handler table and the initial handler-order list
    /// (registration order). Idempotent: second calls are no-ops.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        let mut order = Vec::new();
        for descriptor in self.pending.drain(..) {
            if !order.contains(&descriptor.type_id) {
                order.push(descriptor.type_id);
            }
            self.records
                .entry(descriptor.type_id)
                .or_insert(HandlerRecord { descriptor });
        }
        *self.handler_order.write().unwrap_or_else(|e| e.into_inner()) = order;
        self.initialized = true;
    }

    fn assert_not_init(&self) -> Result<(), RegistryError> {
        if self.initialized {
            Err(RegistryError::AlreadyInitialized)
        } else {
            Ok(())
        }
    }

    fn assert_init(&self) -> Result<(), RegistryError> {
        if self.initialized {
            Ok(())
        } else {
            Err(RegistryError::NotInitialized)
        }
    }

    /// Move the first registered handler matching each given type to the
    /// front of the invocation order, preserving the relative order of the
    /// rest. Idempotent in effect.
    pub fn execute_these_handlers_first(
        &self,
        handler_types: &[TypeId],
    ) -> Result<(), RegistryError> {
        self.assert_init()?;
        let mut order = self.handler_order.write().unwrap_or_else(|e| e.into_inner());
        let mut front = Vec::new();
        for handler_type in handler_types {
            if let Some(pos) = order.iter().position(|h| h == handler_type) {
                front.push(order.remove(pos));
            }
        }
        for (index, handler_type) in front.into_iter().enumerate() {
            order.insert(index, handler_type);
        }
        Ok(())
    }

    /// Counterpart of `execute_these_handlers_first`: moves matches to the
    /// back, in the given order.
    pub fn execute_these_handlers_last(
        &self,
        handler_types: &[TypeId],
    ) -> Result<(), RegistryError> {
        self.assert_init()?;
        let mut order = self.handler_order.write().unwrap_or_else(|e| e.into_inner());
        for handler_type in handler_types {
            if let Some(pos) = order.iter().position(|h| h == handler_type) {
                let moved = order.remove(pos);
                order.push(moved);
            }
        }
        Ok(())
    }

    /// Resolve the ordered dispatch targets for a runtime message type.
    ///
    /// A handler is emitted when any of its declared message types appears in
    /// the structural closure of `message_type`; each handler appears at most
    /// once even if several declared types match.
    pub fn resolve_handlers_for(
        &self,
        message_type: TypeId,
    ) -> Result<Vec<Arc<DispatchInfo>>, RegistryError> {
        self.assert_init()?;
        let closure = self.message_types.closure_of(message_type);
        let order = self.handler_order.read().unwrap_or_else(|e| e.into_inner());
        let mut resolved = Vec::new();
        for handler_type in order.iter() {
            let record = match self.records.get(handler_type) {
                Some(record) => record,
                None => continue,
            };
            let matched = record
                .descriptor
                .targets
                .iter()
                .find(|t| closure.contains(&t.message_type));
            if let Some(target) = matched {
                resolved.push(self.dispatch_info_for(record, target.message_type));
            }
        }
        Ok(resolved)
    }

    /// All registered handled types that satisfy the active message type
    /// conventions.
    pub fn all_message_types(&self) -> Result<Vec<TypeId>, RegistryError> {
        self.assert_init()?;
        let order = self.handler_order.read().unwrap_or_else(|e| e.into_inner());
        let mut types = Vec::new();
        for handler_type in order.iter() {
            if let Some(record) = self.records.get(handler_type) {
                for target in &record.descriptor.targets {
                    if !types.contains(&target.message_type)
                        && self.message_types.is_message_type(target.message_type)
                    {
                        types.push(target.message_type);
                    }
                }
            }
        }
        Ok(types)
    }

    /// Dispatch-info construction is cached per (handler type, message type):
    /// read path takes a read lock, a miss promotes to a write lock with a
    /// double check so concurrent first accesses compute once.
    fn dispatch_info_for(&self, record: &HandlerRecord, message_type: TypeId) -> Arc<DispatchInfo> {
        let key = (record.descriptor.type_id, message_type);
        {
            let cache = self.dispatch_cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(info) = cache.get(&key) {
                return Arc::clone(info);
            }
        }
        let mut cache = self.dispatch_cache.write().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = cache.get(&key) {
            return Arc::clone(info);
        }
        let target = record
            .descriptor
            .targets
            .iter()
            .find(|t| t.message_type == message_type)
            .expect("target selected from this record");
        let info = Arc::new(DispatchInfo {
            message_type,
            handler_type: record.descriptor.type_id,
            handler_name: record.descriptor.name.clone(),
            invoke: Arc::clone(&target.invoke),
            factory: Arc::clone(&record.descriptor.factory),
        });
        cache.insert(key, Arc::clone(&info));
        info
    }
}
