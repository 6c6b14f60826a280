//! Orchestration service: submit, read, advance and dispatch units of work.
//!
//! Every mutation follows the same shape: load the committed snapshot for
//! the caller's owner, apply the requested change to a clone, and hand the
//! clone to the store as a compare-and-swap on the status it was loaded
//! with. Only a successful save is ever returned to the caller; on any error
//! the committed snapshot in the store is the truth.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::admin::AdminGrant;
use super::clock::{Clock, SystemClock};
use super::entity::{Entity, EntityId, Status, WorkKind};
use super::error::{ErrorCode, QuantopsError};
use super::ownership::{OwnerId, scope_to_owner};
use super::settings::{ReplayPolicy, ServiceSettings};
use super::state_machine::{self, TransitionRequest};
use crate::ports::executor_port::{
    CompletionCallback, CompletionSink, DispatchAddress, DispatchOutcome, Executor,
};
use crate::ports::observer_port::TransitionObserver;
use crate::ports::store_port::{AtomicStore, InsertOutcome, ListFilter};

enum Submission {
    Created(Entity),
    Replayed(Entity),
}

/// Cheap to clone; clones share the same store, executors and observers.
#[derive(Clone)]
pub struct OrchestrationService {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    settings: Arc<ServiceSettings>,
    executors: Arc<Vec<Arc<dyn Executor>>>,
    observers: Arc<Vec<Arc<dyn TransitionObserver>>>,
}

pub struct ServiceBuilder {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    settings: ServiceSettings,
    executors: Vec<Arc<dyn Executor>>,
    observers: Vec<Arc<dyn TransitionObserver>>,
}

impl ServiceBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.push(executor);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Fails on duplicate executor names or a default executor that was
    /// never registered.
    pub fn build(self) -> Result<OrchestrationService, QuantopsError> {
        let mut names = HashSet::new();
        for executor in &self.executors {
            if !names.insert(executor.name().to_string()) {
                return Err(QuantopsError::invalid_input(format!(
                    "executor {} registered twice",
                    executor.name()
                )));
            }
        }
        if let Some(default) = &self.settings.default_executor {
            if !names.contains(default) {
                return Err(QuantopsError::ConfigInvalid {
                    section: "executor".into(),
                    key: "default".into(),
                    reason: format!("no executor named {default} is registered"),
                });
            }
        }

        Ok(OrchestrationService {
            store: self.store,
            clock: self.clock,
            settings: Arc::new(self.settings),
            executors: Arc::new(self.executors),
            observers: Arc::new(self.observers),
        })
    }
}

impl OrchestrationService {
    pub fn builder(store: Arc<dyn AtomicStore>) -> ServiceBuilder {
        ServiceBuilder {
            store,
            clock: Arc::new(SystemClock),
            settings: ServiceSettings::default(),
            executors: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// A service with default settings, the system clock and no executors.
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        OrchestrationService {
            store,
            clock: Arc::new(SystemClock),
            settings: Arc::new(ServiceSettings::default()),
            executors: Arc::new(Vec::new()),
            observers: Arc::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn submit(
        &self,
        owner: &OwnerId,
        kind: WorkKind,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<Entity, QuantopsError> {
        match self.submit_inner(owner, kind, payload, idempotency_key)? {
            Submission::Created(entity) | Submission::Replayed(entity) => Ok(entity),
        }
    }

    pub fn get(&self, owner: &OwnerId, id: &EntityId) -> Result<Entity, QuantopsError> {
        self.load_owned(owner, id)
    }

    pub fn list(&self, owner: &OwnerId, filter: &ListFilter) -> Result<Vec<Entity>, QuantopsError> {
        self.store.list(Some(owner), filter)
    }

    pub fn transition(
        &self,
        owner: &OwnerId,
        id: &EntityId,
        request: TransitionRequest,
    ) -> Result<Entity, QuantopsError> {
        let current = self.load_owned(owner, id)?;
        self.commit(&current, request)
    }

    pub fn transition_to(
        &self,
        owner: &OwnerId,
        id: &EntityId,
        to: Status,
    ) -> Result<Entity, QuantopsError> {
        self.transition(owner, id, TransitionRequest::to(to))
    }

    /// Cooperative: moves the entity to its cancel status. In-flight
    /// executor work is not interrupted; its late completion is rejected.
    pub fn cancel(&self, owner: &OwnerId, id: &EntityId) -> Result<Entity, QuantopsError> {
        let current = self.load_owned(owner, id)?;
        let to = current.kind.lifecycle().cancel;
        self.commit(&current, TransitionRequest::to(to))
    }

    /// Back to the initial status; legal only where the kind declares it.
    pub fn retry(&self, owner: &OwnerId, id: &EntityId) -> Result<Entity, QuantopsError> {
        let current = self.load_owned(owner, id)?;
        let to = current.kind.lifecycle().initial;
        self.commit(&current, TransitionRequest::to(to))
    }

    pub fn delete(&self, owner: &OwnerId, id: &EntityId) -> Result<(), QuantopsError> {
        let current = self.load_owned(owner, id)?;
        if !current.is_finished() {
            return Err(QuantopsError::NotDeletable {
                id: id.to_string(),
                status: current.status,
            });
        }
        if !self.store.delete(id)? {
            return Err(QuantopsError::AccessDenied { id: id.to_string() });
        }
        info!(owner = %owner, id = %id, "entity deleted");
        Ok(())
    }

    /// Submit, then hand the new entity to the default executor. Dispatch
    /// problems end in the kind's failure status with
    /// `EXECUTOR_DISPATCH_FAILED`; only store errors are returned as `Err`.
    /// A replayed submission is returned as-is and not dispatched again.
    pub fn submit_and_dispatch(
        &self,
        owner: &OwnerId,
        kind: WorkKind,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<Entity, QuantopsError> {
        match self.submit_inner(owner, kind, payload, idempotency_key)? {
            Submission::Created(entity) => self.dispatch_committed(entity),
            Submission::Replayed(entity) => Ok(entity),
        }
    }

    /// Dispatch an entity that sits in its initial status, e.g. after a retry.
    pub fn dispatch(&self, owner: &OwnerId, id: &EntityId) -> Result<Entity, QuantopsError> {
        let current = self.load_owned(owner, id)?;
        let lifecycle = current.kind.lifecycle();
        if current.status != lifecycle.initial {
            return Err(QuantopsError::InvalidTransition {
                from: current.status,
                to: lifecycle.running,
            });
        }
        self.dispatch_committed(current)
    }

    pub fn admin_get(&self, grant: &AdminGrant, id: &EntityId) -> Result<Entity, QuantopsError> {
        debug!(actor = grant.actor_id(), id = %id, "admin read");
        self.store
            .get(id)?
            .ok_or_else(|| QuantopsError::NotFound { id: id.to_string() })
    }

    pub fn admin_list(
        &self,
        grant: &AdminGrant,
        owner: Option<&OwnerId>,
        filter: &ListFilter,
    ) -> Result<Vec<Entity>, QuantopsError> {
        debug!(actor = grant.actor_id(), "admin list");
        self.store.list(owner, filter)
    }

    /// Removes an entity regardless of owner or status.
    pub fn admin_delete(&self, grant: &AdminGrant, id: &EntityId) -> Result<(), QuantopsError> {
        if !self.store.delete(id)? {
            return Err(QuantopsError::NotFound { id: id.to_string() });
        }
        warn!(actor = grant.actor_id(), id = %id, "entity deleted by admin");
        Ok(())
    }

    fn submit_inner(
        &self,
        owner: &OwnerId,
        kind: WorkKind,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<Submission, QuantopsError> {
        if let Some(key) = idempotency_key {
            if key.trim().is_empty() {
                return Err(QuantopsError::invalid_input("idempotency key must not be blank"));
            }
            if let Some(existing) = self.store.find_by_key(owner, key)? {
                return self.replay(existing, kind, &payload, key);
            }
        }

        let entity = Entity::new(
            owner.clone(),
            kind,
            payload,
            idempotency_key.map(str::to_string),
            self.clock.now(),
        );
        match self.store.save_if_absent(&entity)? {
            InsertOutcome::Inserted(created) => {
                info!(owner = %owner, id = %created.id, kind = %kind, "entity submitted");
                Ok(Submission::Created(created))
            }
            // Lost the insert race: the key was unused when we looked.
            InsertOutcome::Existing(winner) => {
                warn!(owner = %owner, key = ?idempotency_key, winner = %winner.id, "lost idempotency race");
                Err(QuantopsError::IdempotencyConflict {
                    owner_id: owner.to_string(),
                    key: idempotency_key.unwrap_or_default().to_string(),
                })
            }
        }
    }

    fn replay(
        &self,
        existing: Entity,
        kind: WorkKind,
        payload: &Value,
        key: &str,
    ) -> Result<Submission, QuantopsError> {
        let policy = self.settings.replay_policy(kind);
        if policy == ReplayPolicy::Reject || existing.kind != kind || &existing.payload != payload {
            warn!(
                owner = %existing.owner_id,
                key,
                existing = %existing.id,
                ?policy,
                "idempotency conflict"
            );
            return Err(QuantopsError::IdempotencyConflict {
                owner_id: existing.owner_id.to_string(),
                key: key.to_string(),
            });
        }
        debug!(owner = %existing.owner_id, key, id = %existing.id, "submission replayed");
        Ok(Submission::Replayed(existing))
    }

    fn load_owned(&self, owner: &OwnerId, id: &EntityId) -> Result<Entity, QuantopsError> {
        scope_to_owner(owner, id, self.store.get(id)?)
    }

    fn commit(&self, current: &Entity, request: TransitionRequest) -> Result<Entity, QuantopsError> {
        let mut next = current.clone();
        state_machine::apply(&mut next, request, self.clock.now())?;

        match self.store.save(&next) {
            Ok(committed) => {
                debug!(
                    owner = %committed.owner_id,
                    id = %committed.id,
                    from = %current.status,
                    to = %committed.status,
                    "transition committed"
                );
                for observer in self.observers.iter() {
                    observer.on_transition(current, &committed);
                }
                Ok(committed)
            }
            Err(QuantopsError::NotFound { id }) => Err(QuantopsError::AccessDenied { id }),
            Err(e) => {
                warn!(
                    id = %current.id,
                    from = %current.status,
                    to = %next.status,
                    error = %e,
                    "transition not committed"
                );
                Err(e)
            }
        }
    }

    fn default_executor(&self) -> Option<Arc<dyn Executor>> {
        match &self.settings.default_executor {
            Some(name) => self.executors.iter().find(|e| e.name() == name).cloned(),
            None => self.executors.first().cloned(),
        }
    }

    fn dispatch_committed(&self, entity: Entity) -> Result<Entity, QuantopsError> {
        let lifecycle = entity.kind.lifecycle();

        let Some(executor) = self.default_executor() else {
            return self.fail_dispatch(entity, None, None, "no executor registered".to_string());
        };
        let name = executor.name().to_string();

        let dispatch_id = match executor.submit(&entity) {
            Ok(id) => id,
            Err(e) => return self.fail_dispatch(entity, Some(name), None, e.to_string()),
        };

        let running = self.commit(
            &entity,
            TransitionRequest::to(lifecycle.running).with_dispatch(&name, Some(dispatch_id.clone())),
        )?;
        info!(
            owner = %running.owner_id,
            id = %running.id,
            executor = %name,
            dispatch_id = %dispatch_id,
            "entity dispatched"
        );

        let callback = CompletionCallback::new(
            DispatchAddress {
                entity_id: running.id.clone(),
                owner_id: running.owner_id.clone(),
                dispatch_id: dispatch_id.clone(),
            },
            Arc::new(self.clone()),
        );
        match executor.dispatch(&running, &dispatch_id, callback) {
            Ok(()) => {}
            // An inline completion reached the store and the store refused it.
            // The entity stays running; the caller has to see the failure.
            Err(e) if e.code() == ErrorCode::PersistenceFailed => return Err(e),
            Err(e) => {
                return self.fail_dispatch(running, Some(name), Some(dispatch_id), e.to_string());
            }
        }

        self.load_owned(&running.owner_id, &running.id)
    }

    /// Record a dispatch problem on the entity instead of raising it. The
    /// entity passes through running so the failure lands on a legal edge.
    fn fail_dispatch(
        &self,
        entity: Entity,
        executor_name: Option<String>,
        dispatch_id: Option<String>,
        reason: String,
    ) -> Result<Entity, QuantopsError> {
        warn!(
            owner = %entity.owner_id,
            id = %entity.id,
            executor = ?executor_name,
            reason = %reason,
            "dispatch failed"
        );
        let lifecycle = entity.kind.lifecycle();

        let mut current = entity;
        if current.status == lifecycle.initial {
            let mut request = TransitionRequest::to(lifecycle.running);
            if let Some(name) = executor_name {
                request = request.with_dispatch(name, dispatch_id);
            }
            current = self.commit(&current, request)?;
        }

        let request = TransitionRequest::to(lifecycle.failure)
            .with_failure(ErrorCode::ExecutorDispatchFailed.as_str(), reason);
        match self.commit(&current, request) {
            Ok(failed) => Ok(failed),
            // A completion or a cancel got there first; report what is stored.
            Err(QuantopsError::InvalidTransition { .. }) => {
                self.load_owned(&current.owner_id, &current.id)
            }
            Err(e) => Err(e),
        }
    }

    fn ensure_current_dispatch(
        &self,
        entity: &Entity,
        address: &DispatchAddress,
    ) -> Result<(), QuantopsError> {
        if entity.dispatch_id.as_deref() == Some(address.dispatch_id.as_str()) {
            return Ok(());
        }
        Err(QuantopsError::StaleDispatch {
            id: entity.id.to_string(),
            dispatch_id: address.dispatch_id.clone(),
        })
    }
}

impl CompletionSink for OrchestrationService {
    /// Terminal statuses accept nothing, so late or duplicate completions
    /// are rejected by the transition table; a completion for an older
    /// dispatch of a retried entity is rejected as stale.
    fn complete(
        &self,
        address: &DispatchAddress,
        outcome: DispatchOutcome,
    ) -> Result<Entity, QuantopsError> {
        let current = self.load_owned(&address.owner_id, &address.entity_id)?;
        let lifecycle = current.kind.lifecycle();

        let request = match outcome {
            DispatchOutcome::Succeeded { result } => {
                TransitionRequest::to(lifecycle.success).with_result(result)
            }
            DispatchOutcome::Failed {
                error_code,
                error_message,
            } => TransitionRequest::to(lifecycle.failure).with_failure(error_code, error_message),
        };

        state_machine::check(current.kind, current.status, request.to)?;
        self.ensure_current_dispatch(&current, address)?;
        match self.commit(&current, request) {
            // The entity moved on between the read and the write. If a newer
            // dispatch took over, this completion is stale.
            Err(e @ QuantopsError::InvalidTransition { .. }) => {
                let latest = self.load_owned(&address.owner_id, &address.entity_id)?;
                self.ensure_current_dispatch(&latest, address)?;
                Err(e)
            }
            other => other,
        }
    }
}
