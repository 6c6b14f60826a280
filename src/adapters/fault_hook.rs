//! Commit hook that injects a single write failure, for rollback tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::domain::entity::Entity;
use crate::domain::error::QuantopsError;
use crate::ports::store_port::{CommitHook, WriteOp};

/// Fails exactly one write: the Nth one seen (1-based), or the next one
/// after [`FailOnNthWrite::fail_next`]. `0` means disarmed.
#[derive(Debug, Default)]
pub struct FailOnNthWrite {
    writes: AtomicUsize,
    fail_at: AtomicUsize,
}

impl FailOnNthWrite {
    pub fn new(n: usize) -> Self {
        FailOnNthWrite {
            writes: AtomicUsize::new(0),
            fail_at: AtomicUsize::new(n),
        }
    }

    pub fn disarmed() -> Self {
        Self::default()
    }

    pub fn fail_next(&self) {
        let seen = self.writes.load(Ordering::SeqCst);
        self.fail_at.store(seen + 1, Ordering::SeqCst);
    }

    pub fn writes_seen(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl CommitHook for FailOnNthWrite {
    fn before_commit(&self, entity: &Entity, op: WriteOp) -> Result<(), QuantopsError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_at.load(Ordering::SeqCst) {
            tracing::debug!(write = n, ?op, id = %entity.id, "injected commit failure");
            return Err(QuantopsError::CommitRejected {
                reason: format!("injected failure on write {n} ({op:?} {})", entity.id),
            });
        }
        Ok(())
    }
}
