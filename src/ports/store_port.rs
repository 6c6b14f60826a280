//! Persistence port: atomic snapshot store plus the idempotency index.

use crate::domain::entity::{Entity, EntityId, Status, WorkKind};
use crate::domain::error::QuantopsError;
use crate::domain::ownership::OwnerId;

/// Outcome of [`AtomicStore::save_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Entity),
    /// The (owner, key) pair was already indexed; nothing was written.
    Existing(Entity),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Update,
    Delete,
}

/// Runs inside the store's critical section, after the write has been
/// validated and before anything becomes durable. An error aborts the write.
pub trait CommitHook: Send + Sync {
    fn before_commit(&self, entity: &Entity, op: WriteOp) -> Result<(), QuantopsError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub kind: Option<WorkKind>,
    pub status: Option<Status>,
}

impl ListFilter {
    pub fn matches(&self, entity: &Entity) -> bool {
        self.kind.is_none_or(|k| entity.kind == k) && self.status.is_none_or(|s| entity.status == s)
    }
}

/// Every backend must give the same guarantees:
/// each method is one critical section, reads hand out copies, and a failed
/// write leaves the previous committed state untouched.
pub trait AtomicStore: Send + Sync {
    /// Insert `entity` and, when it carries an idempotency key, its index
    /// entry. If the (owner, key) pair is already indexed the existing entity
    /// is returned instead and nothing is written.
    fn save_if_absent(&self, entity: &Entity) -> Result<InsertOutcome, QuantopsError>;

    /// Commit a full snapshot if the stored revision still equals
    /// `entity.revision`, and return it with the revision bumped. A mismatch
    /// yields `InvalidTransition { from: stored.status, to: entity.status }`;
    /// a missing id or another owner's id yields `NotFound`.
    fn save(&self, entity: &Entity) -> Result<Entity, QuantopsError>;

    fn get(&self, id: &EntityId) -> Result<Option<Entity>, QuantopsError>;

    fn find_by_key(&self, owner: &OwnerId, key: &str) -> Result<Option<Entity>, QuantopsError>;

    /// `owner = None` lists across tenants; only the admin path passes it.
    /// Ordered by `created_at`, then id.
    fn list(&self, owner: Option<&OwnerId>, filter: &ListFilter)
    -> Result<Vec<Entity>, QuantopsError>;

    /// Remove the entity together with its index entry.
    fn delete(&self, id: &EntityId) -> Result<bool, QuantopsError>;
}
