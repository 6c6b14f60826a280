//! Executor port: out-of-line work with a single terminal callback.

use serde_json::Value;
use std::sync::Arc;

use crate::domain::entity::{Entity, EntityId};
use crate::domain::error::QuantopsError;
use crate::domain::ownership::OwnerId;

/// Where a completion report must land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchAddress {
    pub entity_id: EntityId,
    pub owner_id: OwnerId,
    pub dispatch_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Succeeded { result: Value },
    Failed { error_code: String, error_message: String },
}

/// The join point back into the orchestration layer.
pub trait CompletionSink: Send + Sync {
    fn complete(
        &self,
        address: &DispatchAddress,
        outcome: DispatchOutcome,
    ) -> Result<Entity, QuantopsError>;
}

/// Handed to [`Executor::dispatch`]. `complete` consumes it, so an executor
/// can report at most once per dispatch.
pub struct CompletionCallback {
    address: DispatchAddress,
    sink: Arc<dyn CompletionSink>,
}

impl CompletionCallback {
    pub fn new(address: DispatchAddress, sink: Arc<dyn CompletionSink>) -> Self {
        CompletionCallback { address, sink }
    }

    pub fn address(&self) -> &DispatchAddress {
        &self.address
    }

    pub fn complete(self, outcome: DispatchOutcome) -> Result<Entity, QuantopsError> {
        self.sink.complete(&self.address, outcome)
    }
}

impl std::fmt::Debug for CompletionCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionCallback")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Reserve a dispatch id before any work starts.
    fn submit(&self, entity: &Entity) -> Result<String, QuantopsError>;

    /// Start the work. The callback must be invoked exactly once, possibly
    /// on another thread and possibly before this method returns.
    fn dispatch(
        &self,
        entity: &Entity,
        dispatch_id: &str,
        callback: CompletionCallback,
    ) -> Result<(), QuantopsError>;
}
