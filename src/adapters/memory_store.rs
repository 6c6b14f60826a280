//! In-process store: one mutex over the entity table and idempotency index.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::entity::{Entity, EntityId};
use crate::domain::error::QuantopsError;
use crate::domain::ownership::OwnerId;
use crate::ports::store_port::{AtomicStore, CommitHook, InsertOutcome, ListFilter, WriteOp};

#[derive(Default)]
struct Tables {
    entities: HashMap<EntityId, Entity>,
    keys: HashMap<(OwnerId, String), EntityId>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    hook: Option<Arc<dyn CommitHook>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(hook: Arc<dyn CommitHook>) -> Self {
        MemoryStore {
            tables: Mutex::new(Tables::default()),
            hook: Some(hook),
        }
    }

    // Every write validates before it touches the maps, so a poisoned lock
    // still guards a consistent state.
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_hook(&self, entity: &Entity, op: WriteOp) -> Result<(), QuantopsError> {
        match &self.hook {
            Some(hook) => hook.before_commit(entity, op),
            None => Ok(()),
        }
    }
}

impl AtomicStore for MemoryStore {
    fn save_if_absent(&self, entity: &Entity) -> Result<InsertOutcome, QuantopsError> {
        let mut tables = self.lock();

        let index_key = entity
            .idempotency_key
            .as_ref()
            .map(|key| (entity.owner_id.clone(), key.clone()));

        if let Some(existing_id) = index_key.as_ref().and_then(|k| tables.keys.get(k)) {
            if let Some(existing) = tables.entities.get(existing_id) {
                return Ok(InsertOutcome::Existing(existing.clone()));
            }
        }
        if tables.entities.contains_key(&entity.id) {
            return Err(QuantopsError::DatabaseQuery {
                reason: format!("duplicate entity id {}", entity.id),
            });
        }

        self.run_hook(entity, WriteOp::Insert)?;

        tables.entities.insert(entity.id.clone(), entity.clone());
        if let Some(k) = index_key {
            tables.keys.insert(k, entity.id.clone());
        }
        Ok(InsertOutcome::Inserted(entity.clone()))
    }

    fn save(&self, entity: &Entity) -> Result<Entity, QuantopsError> {
        let mut tables = self.lock();

        let stored = match tables.entities.get(&entity.id) {
            Some(stored) if stored.owner_id == entity.owner_id => stored,
            _ => {
                return Err(QuantopsError::NotFound {
                    id: entity.id.to_string(),
                });
            }
        };
        if stored.revision != entity.revision {
            return Err(QuantopsError::InvalidTransition {
                from: stored.status,
                to: entity.status,
            });
        }

        let committed = Entity {
            revision: entity.revision + 1,
            ..entity.clone()
        };
        self.run_hook(&committed, WriteOp::Update)?;

        tables.entities.insert(committed.id.clone(), committed.clone());
        Ok(committed)
    }

    fn get(&self, id: &EntityId) -> Result<Option<Entity>, QuantopsError> {
        Ok(self.lock().entities.get(id).cloned())
    }

    fn find_by_key(&self, owner: &OwnerId, key: &str) -> Result<Option<Entity>, QuantopsError> {
        let tables = self.lock();
        Ok(tables
            .keys
            .get(&(owner.clone(), key.to_string()))
            .and_then(|id| tables.entities.get(id))
            .cloned())
    }

    fn list(
        &self,
        owner: Option<&OwnerId>,
        filter: &ListFilter,
    ) -> Result<Vec<Entity>, QuantopsError> {
        let tables = self.lock();
        let mut found: Vec<Entity> = tables
            .entities
            .values()
            .filter(|e| owner.is_none_or(|o| &e.owner_id == o))
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    fn delete(&self, id: &EntityId) -> Result<bool, QuantopsError> {
        let mut tables = self.lock();
        let Some(entity) = tables.entities.get(id).cloned() else {
            return Ok(false);
        };

        self.run_hook(&entity, WriteOp::Delete)?;

        tables.entities.remove(id);
        if let Some(key) = entity.idempotency_key {
            tables.keys.remove(&(entity.owner_id, key));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fault_hook::FailOnNthWrite;
    use crate::domain::entity::{Status, WorkKind};
    use chrono::Utc;
    use serde_json::json;

    fn job(owner: &str, key: Option<&str>) -> Entity {
        Entity::new(
            OwnerId::new(owner).unwrap(),
            WorkKind::Job,
            json!({"n": 1}),
            key.map(str::to_string),
            Utc::now(),
        )
    }

    #[test]
    fn insert_then_get_returns_copy() {
        let store = MemoryStore::new();
        let e = job("u-1", Some("k1"));
        assert_eq!(
            store.save_if_absent(&e).unwrap(),
            InsertOutcome::Inserted(e.clone())
        );

        let mut copy = store.get(&e.id).unwrap().unwrap();
        copy.status = Status::Cancelled;
        assert_eq!(store.get(&e.id).unwrap().unwrap().status, Status::Queued);
    }

    #[test]
    fn second_insert_with_same_key_returns_existing() {
        let store = MemoryStore::new();
        let first = job("u-1", Some("k1"));
        let second = job("u-1", Some("k1"));
        store.save_if_absent(&first).unwrap();
        assert_eq!(
            store.save_if_absent(&second).unwrap(),
            InsertOutcome::Existing(first.clone())
        );
        assert!(store.get(&second.id).unwrap().is_none());
    }

    #[test]
    fn keys_are_scoped_per_owner() {
        let store = MemoryStore::new();
        store.save_if_absent(&job("u-1", Some("k1"))).unwrap();
        let other = job("u-2", Some("k1"));
        assert!(matches!(
            store.save_if_absent(&other).unwrap(),
            InsertOutcome::Inserted(_)
        ));
    }

    #[test]
    fn save_is_compare_and_swap_on_revision() {
        let store = MemoryStore::new();
        let e = job("u-1", None);
        store.save_if_absent(&e).unwrap();

        let mut running = e.clone();
        running.status = Status::Running;
        let committed = store.save(&running).unwrap();
        assert_eq!(committed.revision, 1);

        let mut cancelled = e.clone();
        cancelled.status = Status::Cancelled;
        let err = store.save(&cancelled).unwrap_err();
        assert!(matches!(
            err,
            QuantopsError::InvalidTransition { from: Status::Running, to: Status::Cancelled }
        ));
    }

    #[test]
    fn matching_status_at_an_older_revision_is_refused() {
        let store = MemoryStore::new();
        let e = job("u-1", None);
        store.save_if_absent(&e).unwrap();

        let mut running = e.clone();
        running.status = Status::Running;
        running.dispatch_id = Some("d1".into());
        let first = store.save(&running).unwrap();

        let mut again = first.clone();
        again.dispatch_id = Some("d2".into());
        store.save(&again).unwrap();

        let mut stale = first.clone();
        stale.status = Status::Succeeded;
        assert!(store.save(&stale).is_err());
        assert_eq!(store.get(&e.id).unwrap().unwrap().dispatch_id.as_deref(), Some("d2"));
    }

    #[test]
    fn failed_hook_leaves_state_untouched() {
        let store = MemoryStore::with_hook(Arc::new(FailOnNthWrite::new(2)));
        let e = job("u-1", Some("k1"));
        store.save_if_absent(&e).unwrap();

        let mut running = e.clone();
        running.status = Status::Running;
        assert!(matches!(
            store.save(&running),
            Err(QuantopsError::CommitRejected { .. })
        ));
        assert_eq!(store.get(&e.id).unwrap().unwrap(), e);
    }

    #[test]
    fn delete_frees_the_key() {
        let store = MemoryStore::new();
        let e = job("u-1", Some("k1"));
        store.save_if_absent(&e).unwrap();
        assert!(store.delete(&e.id).unwrap());
        assert!(!store.delete(&e.id).unwrap());
        assert!(store
            .find_by_key(&e.owner_id, "k1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn list_filters_by_owner() {
        let store = MemoryStore::new();
        store.save_if_absent(&job("u-1", None)).unwrap();
        store.save_if_absent(&job("u-1", None)).unwrap();
        store.save_if_absent(&job("u-2", None)).unwrap();
        let owner = OwnerId::new("u-1").unwrap();
        assert_eq!(store.list(Some(&owner), &ListFilter::default()).unwrap().len(), 2);
        assert_eq!(store.list(None, &ListFilter::default()).unwrap().len(), 3);
    }
}
