//! Hook for downstream effects of committed transitions.

use crate::domain::entity::Entity;

/// Called once per committed transition, after the store lock is released.
/// `before.owner_id == after.owner_id` always holds.
pub trait TransitionObserver: Send + Sync {
    fn on_transition(&self, before: &Entity, after: &Entity);
}
