//! In-process executor: runs a per-kind handler inline or on its own thread.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::domain::entity::{Entity, WorkKind};
use crate::domain::error::{ErrorCode, QuantopsError};
use crate::domain::ownership::OwnerId;
use crate::ports::executor_port::{CompletionCallback, DispatchOutcome, Executor};

/// A business-level failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub code: String,
    pub message: String,
}

impl HandlerFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerFailure {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The owner is part of the signature on purpose: a handler cannot be
/// registered unless it accepts it.
pub trait WorkHandler: Send + Sync {
    fn handle(&self, owner_id: &OwnerId, entity: &Entity) -> Result<Value, HandlerFailure>;
}

impl<F> WorkHandler for F
where
    F: Fn(&OwnerId, &Entity) -> Result<Value, HandlerFailure> + Send + Sync,
{
    fn handle(&self, owner_id: &OwnerId, entity: &Entity) -> Result<Value, HandlerFailure> {
        self(owner_id, entity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Handler runs on the dispatching thread; completion lands before
    /// `dispatch` returns.
    Inline,
    Thread,
}

pub struct LocalExecutor {
    name: String,
    mode: ExecutionMode,
    handlers: HashMap<WorkKind, Arc<dyn WorkHandler>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalExecutor {
    pub fn new(name: impl Into<String>, mode: ExecutionMode) -> Self {
        LocalExecutor {
            name: name.into(),
            mode,
            handlers: HashMap::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_handler(mut self, kind: WorkKind, handler: impl WorkHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Join every worker spawned so far.
    pub fn wait_idle(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!(executor = %self.name, "worker thread panicked outside its handler");
            }
        }
    }

    fn handler_for(&self, kind: WorkKind) -> Result<Arc<dyn WorkHandler>, QuantopsError> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| QuantopsError::ExecutorDispatchFailed {
                executor: self.name.clone(),
                reason: format!("no handler registered for {kind}"),
            })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_handler(handler: &dyn WorkHandler, entity: &Entity) -> DispatchOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&entity.owner_id, entity))) {
        Ok(Ok(result)) => DispatchOutcome::Succeeded { result },
        Ok(Err(failure)) => DispatchOutcome::Failed {
            error_code: failure.code,
            error_message: failure.message,
        },
        Err(payload) => DispatchOutcome::Failed {
            error_code: ErrorCode::ExecutorDispatchFailed.as_str().to_string(),
            error_message: format!("handler panicked: {}", panic_message(payload.as_ref())),
        },
    }
}

/// Rejections by the transition table are logged and swallowed. A store
/// failure is handed back to the caller.
fn report(
    executor: &str,
    callback: CompletionCallback,
    outcome: DispatchOutcome,
) -> Result<(), QuantopsError> {
    let address = callback.address().clone();
    match callback.complete(outcome) {
        Ok(_) => Ok(()),
        Err(e) if e.code() == ErrorCode::PersistenceFailed => {
            tracing::error!(
                executor,
                id = %address.entity_id,
                dispatch_id = %address.dispatch_id,
                error = %e,
                "completion not persisted"
            );
            Err(e)
        }
        Err(e) => {
            tracing::warn!(
                executor,
                id = %address.entity_id,
                dispatch_id = %address.dispatch_id,
                error = %e,
                "completion rejected"
            );
            Ok(())
        }
    }
}

impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, entity: &Entity) -> Result<String, QuantopsError> {
        self.handler_for(entity.kind)?;
        Ok(uuid::Uuid::new_v4().to_string())
    }

    fn dispatch(
        &self,
        entity: &Entity,
        dispatch_id: &str,
        callback: CompletionCallback,
    ) -> Result<(), QuantopsError> {
        let handler = self.handler_for(entity.kind)?;

        match self.mode {
            ExecutionMode::Inline => {
                let outcome = run_handler(handler.as_ref(), entity);
                report(&self.name, callback, outcome)
            }
            ExecutionMode::Thread => {
                let entity = entity.clone();
                let name = self.name.clone();
                let handle = thread::Builder::new()
                    .name(format!("{}-{}", self.name, dispatch_id))
                    .spawn(move || {
                        let outcome = run_handler(handler.as_ref(), &entity);
                        // Nobody is waiting on this thread; report has logged it.
                        let _ = report(&name, callback, outcome);
                    })
                    .map_err(|e| QuantopsError::ExecutorDispatchFailed {
                        executor: self.name.clone(),
                        reason: e.to_string(),
                    })?;
                let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
                workers.retain(|worker| !worker.is_finished());
                workers.push(handle);
                Ok(())
            }
        }
    }
}
