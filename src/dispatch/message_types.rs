//! Message type registration, conventions, and structural closure.
//!
//! The runtime never scans for message types; everything a service handles
//! or sends is registered explicitly at startup. Rust has no inheritance, so
//! the "base type" relationship of a message is declared as a parent link
//! with a projection: a derived message embeds its parent and tells the
//! registry how to view it as that parent.
//!
//! ```
//! use unibus::dispatch::MessageTypeRegistry;
//!
//! struct BaseMsg { text: String }
//! struct DerivedMsg { base: BaseMsg, extra: u32 }
//!
//! let mut types = MessageTypeRegistry::new();
//! types.register::<BaseMsg>("BaseMsg");
//! types
//!     .register::<DerivedMsg>("DerivedMsg")
//!     .with_parent::<BaseMsg>(|m| &m.base);
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// What the conventions see when asked "is this a message type?".
#[derive(Debug, Clone)]
pub struct MessageTypeDescriptor {
    pub name: String,
    /// Whether the type was registered as a message, as opposed to a
    /// structural parent used only for projection.
    pub marked_as_message: bool,
}

type ConventionFn = Arc<dyn Fn(&MessageTypeDescriptor) -> bool + Send + Sync>;
type ProjectFn = Arc<dyn Fn(&dyn Any) -> Option<&dyn Any> + Send + Sync>;

/// The ordered set of predicates deciding what counts as a message type.
///
/// The default convention accepts any type explicitly marked as a message at
/// registration.
#[derive(Clone)]
pub struct MessageTypeConventions {
    predicates: Vec<ConventionFn>,
}

impl Default for MessageTypeConventions {
    fn default() -> Self {
        Self {
            predicates: vec![Arc::new(|d: &MessageTypeDescriptor| d.marked_as_message)],
        }
    }
}

impl MessageTypeConventions {
    pub fn add_convention(
        &mut self,
        convention: impl Fn(&MessageTypeDescriptor) -> bool + Send + Sync + 'static,
    ) {
        self.predicates.push(Arc::new(convention));
    }

    pub fn is_message_type(&self, descriptor: &MessageTypeDescriptor) -> bool {
        self.predicates.iter().any(|p| p(descriptor))
    }
}

struct ParentLink {
    target: TypeId,
    project: ProjectFn,
}

struct MessageTypeEntry {
    descriptor: MessageTypeDescriptor,
    parents: Vec<ParentLink>,
}

/// Build-once table of registered message types and their parent links.
///
/// Frozen when the handler registry initializes; read-heavy afterwards.
#[derive(Default)]
pub struct MessageTypeRegistry {
    entries: HashMap<TypeId, MessageTypeEntry>,
    by_name: HashMap<String, TypeId>,
    conventions: MessageTypeConventions,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type under a stable wire name.
    pub fn register<M: Any + Send + Sync>(&mut self, name: &str) -> MessageTypeBuilder<'_, M> {
        self.insert::<M>(name, true)
    }

    /// Register a type used only as a structural parent (a value-holder base
    /// that handlers may target but that is not itself sent on the wire).
    pub fn register_structural<M: Any + Send + Sync>(
        &mut self,
        name: &str,
    ) -> MessageTypeBuilder<'_, M> {
        self.insert::<M>(name, false)
    }

    fn insert<M: Any + Send + Sync>(
        &mut self,
        name: &str,
        marked_as_message: bool,
    ) -> MessageTypeBuilder<'_, M> {
        let type_id = TypeId::of::<M>();
        self.entries.entry(type_id).or_insert_with(|| MessageTypeEntry {
            descriptor: MessageTypeDescriptor {
                name: name.to_string(),
                marked_as_message,
            },
            parents: Vec::new(),
        });
        self.by_name.insert(name.to_string(), type_id);
        MessageTypeBuilder {
            registry: self,
            type_id,
            _marker: PhantomData,
        }
    }

    pub fn add_convention(
        &mut self,
        convention: impl Fn(&MessageTypeDescriptor) -> bool + Send + Sync + 'static,
    ) {
        self.conventions.add_convention(convention);
    }

    pub fn is_message_type(&self, type_id: TypeId) -> bool {
        self.entries
            .get(&type_id)
            .map(|e| self.conventions.is_message_type(&e.descriptor))
            .unwrap_or(false)
    }

    pub fn name_of(&self, type_id: TypeId) -> Option<&str> {
        self.entries.get(&type_id).map(|e| e.descriptor.name.as_str())
    }

    pub fn type_for_name(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    /// The type plus its transitive parents, in declaration order, each once.
    pub fn closure_of(&self, type_id: TypeId) -> Vec<TypeId> {
        let mut closure = Vec::new();
        self.collect_closure(type_id, &mut closure);
        closure
    }

    fn collect_closure(&self, type_id: TypeId, closure: &mut Vec<TypeId>) {
        if closure.contains(&type_id) {
            return;
        }
        closure.push(type_id);
        if let Some(entry) = self.entries.get(&type_id) {
            for link in &entry.parents {
                self.collect_closure(link.target, closure);
            }
        }
    }

    /// View a concrete message as one of the types in its closure.
    ///
    /// Returns `None` when `target` is not in the closure of the message's
    /// runtime type.
    pub fn project<'a>(&self, view: &'a dyn Any, target: TypeId) -> Option<&'a dyn Any> {
        self.project_from(view.type_id(), view, target)
    }

    fn project_from<'a>(
        &self,
        current: TypeId,
        view: &'a dyn Any,
        target: TypeId,
    ) -> Option<&'a dyn Any> {
        if current == target {
            return Some(view);
        }
        let entry = self.entries.get(&current)?;
        for link in &entry.parents {
            if let Some(parent_view) = (link.project)(view) {
                if let Some(found) = self.project_from(link.target, parent_view, target) {
                    return Some(found);
                }
            }
        }
        None
    }
}

/// Registration handle returned by [`MessageTypeRegistry::register`].
pub struct MessageTypeBuilder<'r, M> {
    registry: &'r mut MessageTypeRegistry,
    type_id: TypeId,
    _marker: PhantomData<M>,
}

impl<M: Any + Send + Sync> MessageTypeBuilder<'_, M> {
    /// Declare that `M` structurally satisfies `P`, supplying the projection
    /// used when a handler targets `P` and the runtime message is `M`.
    ///
    /// `P` must itself be registered (as a message or structurally) for the
    /// closure walk to continue past it.
    pub fn with_parent<P: Any + Send + Sync>(self, project: fn(&M) -> &P) -> Self {
        let link = ParentLink {
            target: TypeId::of::<P>(),
            project: Arc::new(move |any: &dyn Any| {
                any.downcast_ref::<M>().map(|m| project(m) as &dyn Any)
            }),
        };
        let entry = self
            .registry
            .entries
            .get_mut(&self.type_id)
            .expect("entry inserted by register");
        entry.parents.push(link);
        self
    }
}
