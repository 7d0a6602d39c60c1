//! Per-execution lock arena.
//!
//! One `tokio::sync::Mutex` per execution ID, created on first use and
//! dropped again by [`ExecutionLocks::release`] once nobody holds it. For the
//! snapshot store the guarded value is the execution's snapshot cursor, so
//! sequence allocation and execution-record mutations share the same critical
//! section. The engine keeps a second arena of unit locks to serialize its
//! control operations.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Snapshot allocation state for one execution.
#[derive(Debug, Default)]
pub struct ExecutionCursor {
    /// Set once the cursor has been seeded from the stored log.
    pub loaded: bool,
    /// Sequence number the next appended snapshot receives.
    pub next_sequence: u64,
    /// Step index of the most recently appended snapshot.
    pub last_step_index: Option<u32>,
}

/// Timed out waiting for an execution's lock.
#[derive(Debug, Clone, thiserror::Error)]
#[error("execution {execution_id} is busy (lock not acquired within {waited_ms}ms)")]
pub struct LockTimeout {
    pub execution_id: Uuid,
    pub waited_ms: u64,
}

#[derive(Debug)]
pub struct ExecutionLocks<T = ExecutionCursor> {
    locks: DashMap<Uuid, Arc<Mutex<T>>>,
    timeout: Duration,
}

impl<T: Default> ExecutionLocks<T> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    /// Acquire the execution's lock, waiting at most the configured timeout.
    pub async fn acquire(
        &self,
        execution_id: Uuid,
    ) -> Result<OwnedMutexGuard<T>, LockTimeout> {
        let lock = Arc::clone(self.locks.entry(execution_id).or_default().value());
        tokio::time::timeout(self.timeout, lock.lock_owned())
            .await
            .map_err(|_| LockTimeout {
                execution_id,
                waited_ms: self.timeout.as_millis() as u64,
            })
    }

    /// Remove the slot if no guard or waiter holds a reference to it.
    ///
    /// `acquire` clones the slot under the same shard lock, so a slot that is
    /// about to be locked is never removed.
    pub fn release(&self, execution_id: Uuid) -> bool {
        self.locks
            .remove_if(&execution_id, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
    }

    /// Number of executions with a lock slot.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
