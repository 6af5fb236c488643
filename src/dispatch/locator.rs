//! The scope / dependency-provider seam the dispatcher resolves handler
//! instances from.
//!
//! The core depends only on this minimal capability interface; any DI
//! container (or the in-crate [`BasicServiceLocator`]) can implement it.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// A scope-owned handler instance. Shared instances are locked for the
/// duration of one invocation and are never dropped by the dispatcher.
pub type SharedInstance = Arc<Mutex<Box<dyn Any + Send>>>;

/// Minimal service-locator capability: resolve an instance by type, inject
/// dependencies into an existing instance, clone as an independent child
/// scope.
pub trait ServiceLocator: Send + Sync {
    /// Resolve a registered instance, or `None` if the scope has none.
    fn resolve(&self, type_id: TypeId) -> Option<SharedInstance>;

    /// Inject scope-managed dependencies into an existing instance.
    /// Implementations without property injection can leave the default.
    fn build_up(&self, _instance: &mut dyn Any) {}

    /// A child scope inheriting current registrations with an independent
    /// lifetime.
    fn child(&self) -> Box<dyn ServiceLocator>;
}

/// A hand-rolled registry-backed locator, sufficient for tests and
/// single-process hosting.
#[derive(Default)]
pub struct BasicServiceLocator {
    instances: RwLock<HashMap<TypeId, SharedInstance>>,
}

impl BasicServiceLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance resolved by its concrete type.
    pub fn register_instance<T: Any + Send>(&self, instance: T) {
        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(TypeId::of::<T>(), Arc::new(Mutex::new(Box::new(instance))));
    }

    /// Register an already-shared instance under an explicit type id.
    pub fn register_shared(&self, type_id: TypeId, instance: SharedInstance) {
        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(type_id, instance);
    }
}

impl ServiceLocator for BasicServiceLocator {
    fn resolve(&self, type_id: TypeId) -> Option<SharedInstance> {
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&type_id)
            .map(Arc::clone)
    }

    fn child(&self) -> Box<dyn ServiceLocator> {
        let snapshot = self
            .instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Box::new(BasicServiceLocator {
            instances: RwLock::new(snapshot),
        })
    }
}
