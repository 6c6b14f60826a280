#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use quantops::adapters::memory_store::MemoryStore;
use quantops::domain::clock::ManualClock;
use quantops::domain::entity::{Entity, EntityId, Status};
use quantops::domain::error::QuantopsError;
use quantops::domain::ownership::OwnerId;
use quantops::domain::service::{OrchestrationService, ServiceBuilder};
use quantops::ports::executor_port::{CompletionCallback, Executor};
use quantops::ports::observer_port::TransitionObserver;
use quantops::ports::store_port::AtomicStore;
use std::sync::{Arc, Mutex};

pub fn owner(name: &str) -> OwnerId {
    OwnerId::new(name).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    let start = Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap();
    Arc::new(ManualClock::new(start, Duration::milliseconds(10)))
}

pub fn builder_on(store: Arc<dyn AtomicStore>) -> ServiceBuilder {
    OrchestrationService::builder(store).clock(manual_clock())
}

pub fn memory_service() -> OrchestrationService {
    builder_on(Arc::new(MemoryStore::new())).build().unwrap()
}

/// Records every committed transition, like a downstream ledger would.
#[derive(Default)]
pub struct Ledger {
    entries: Mutex<Vec<(EntityId, Status, Status)>>,
}

impl Ledger {
    pub fn entries(&self) -> Vec<(EntityId, Status, Status)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count_into(&self, id: &EntityId, status: Status) -> usize {
        self.entries()
            .iter()
            .filter(|(entry_id, _, to)| entry_id == id && *to == status)
            .count()
    }
}

impl TransitionObserver for Ledger {
    fn on_transition(&self, before: &Entity, after: &Entity) {
        assert_eq!(before.owner_id, after.owner_id);
        self.entries
            .lock()
            .unwrap()
            .push((after.id.clone(), before.status, after.status));
    }
}

/// Accepts dispatches and holds the callbacks so a test decides when, and
/// whether, each one completes.
pub struct ParkedExecutor {
    name: String,
    refuse_submit: bool,
    next_id: Mutex<u32>,
    parked: Mutex<Vec<CompletionCallback>>,
}

impl ParkedExecutor {
    pub fn new(name: &str) -> Self {
        ParkedExecutor {
            name: name.to_string(),
            refuse_submit: false,
            next_id: Mutex::new(0),
            parked: Mutex::new(Vec::new()),
        }
    }

    pub fn refusing(name: &str) -> Self {
        ParkedExecutor {
            refuse_submit: true,
            ..Self::new(name)
        }
    }

    pub fn take(&self) -> Vec<CompletionCallback> {
        std::mem::take(&mut *self.parked.lock().unwrap())
    }

    pub fn take_one(&self) -> CompletionCallback {
        let mut parked = self.take();
        assert_eq!(parked.len(), 1, "expected exactly one parked dispatch");
        parked.remove(0)
    }
}

impl Executor for ParkedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, _entity: &Entity) -> Result<String, QuantopsError> {
        if self.refuse_submit {
            return Err(QuantopsError::ExecutorDispatchFailed {
                executor: self.name.clone(),
                reason: "queue full".to_string(),
            });
        }
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        Ok(format!("{}-{}", self.name, *next))
    }

    fn dispatch(
        &self,
        _entity: &Entity,
        _dispatch_id: &str,
        callback: CompletionCallback,
    ) -> Result<(), QuantopsError> {
        self.parked.lock().unwrap().push(callback);
        Ok(())
    }
}
