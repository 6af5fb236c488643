//! Unit-of-work lifecycle hooks wrapped around each dispatch call.

use super::dispatcher::DispatchError;
use super::locator::ServiceLocator;
use crate::unicast::MessageContext;

/// A begin/end boundary around one dispatch call, used for resource scoping
/// (e.g. transactional persistence) independent of the queue transaction.
///
/// Zero or more managers may be registered on the dispatcher; all are
/// invoked, in registration order both ways, every dispatch. `end` always
/// runs, with the surfaced error when dispatch failed.
pub trait UnitOfWorkManager: Send + Sync {
    fn begin(&self, scope: &dyn ServiceLocator, ctx: &MessageContext)
        -> Result<(), DispatchError>;

    fn end(
        &self,
        scope: &dyn ServiceLocator,
        ctx: &MessageContext,
        error: Option<&DispatchError>,
    ) -> Result<(), DispatchError>;
}
