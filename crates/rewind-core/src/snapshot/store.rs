//! Append-only snapshot store.
//!
//! Wraps a `SnapshotRepository` with per-execution sequencing. Every append
//! happens through a `SnapshotWriter`, which holds the execution's lock for
//! as long as it lives; callers that also mutate the execution record do so
//! while holding the same writer.

use std::time::Duration;

use rewind_types::error::{ErrorKind, RepositoryError};
use rewind_types::snapshot::{
    ExecutionSnapshot, NewSnapshot, SnapshotOrder, SnapshotQuery, SnapshotType,
};
use rewind_types::value::first_non_finite;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::locks::{ExecutionCursor, ExecutionLocks, LockTimeout};
use crate::repository::snapshot::SnapshotRepository;

// ---------------------------------------------------------------------------
// SnapshotError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl SnapshotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SnapshotError::SnapshotNotFound(_) | SnapshotError::ExecutionNotFound(_) => {
                ErrorKind::NotFound
            }
            SnapshotError::Validation(_) => ErrorKind::Validation,
            SnapshotError::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            SnapshotError::Repository(_) => ErrorKind::Storage,
        }
    }
}

impl From<LockTimeout> for SnapshotError {
    fn from(e: LockTimeout) -> Self {
        SnapshotError::ConcurrencyConflict(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

/// Generic over `S: SnapshotRepository` so it works with any storage backend.
#[derive(Debug)]
pub struct SnapshotStore<S: SnapshotRepository> {
    repo: S,
    locks: ExecutionLocks,
}

impl<S: SnapshotRepository> SnapshotStore<S> {
    pub fn new(repo: S, lock_timeout: Duration) -> Self {
        Self {
            repo,
            locks: ExecutionLocks::new(lock_timeout),
        }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &S {
        &self.repo
    }

    /// Take the execution's lock and return a writer bound to it.
    ///
    /// Fails with `ConcurrencyConflict` when the lock isn't acquired within
    /// the configured timeout.
    pub async fn lock(&self, execution_id: Uuid) -> Result<SnapshotWriter<'_, S>, SnapshotError> {
        let mut cursor = self.locks.acquire(execution_id).await?;
        if !cursor.loaded {
            if let Some(latest) = self.repo.latest_snapshot(&execution_id).await? {
                cursor.next_sequence = latest.sequence + 1;
                cursor.last_step_index = Some(latest.step_index);
            }
            cursor.loaded = true;
        }
        Ok(SnapshotWriter {
            repo: &self.repo,
            execution_id,
            cursor,
        })
    }

    /// Drop the execution's lock slot if nobody holds or waits on it. The
    /// next writer reseeds its cursor from the stored log.
    pub fn release(&self, execution_id: Uuid) -> bool {
        self.locks.release(execution_id)
    }

    /// Number of executions with a live lock slot.
    pub fn lock_slots(&self) -> usize {
        self.locks.len()
    }

    /// Append one snapshot under the execution's lock.
    pub async fn create_snapshot(
        &self,
        snapshot: NewSnapshot,
    ) -> Result<ExecutionSnapshot, SnapshotError> {
        let mut writer = self.lock(snapshot.execution_id).await?;
        writer.append(snapshot).await
    }

    /// Snapshots of one execution ordered by step index, then creation.
    pub async fn get_execution_snapshots(
        &self,
        execution_id: Uuid,
        query: &SnapshotQuery,
    ) -> Result<Vec<ExecutionSnapshot>, SnapshotError> {
        if query.is_reversed() {
            return Err(SnapshotError::Validation(format!(
                "from_step {} is after to_step {}",
                query.from_step.unwrap_or_default(),
                query.to_step.unwrap_or_default()
            )));
        }
        Ok(self
            .repo
            .list_snapshots(&execution_id, query, SnapshotOrder::Step)
            .await?)
    }

    /// Snapshots of one execution in creation order.
    pub async fn get_snapshot_log(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionSnapshot>, SnapshotError> {
        Ok(self
            .repo
            .list_snapshots(&execution_id, &SnapshotQuery::default(), SnapshotOrder::Creation)
            .await?)
    }

    pub async fn get_snapshot(&self, snapshot_id: Uuid) -> Result<ExecutionSnapshot, SnapshotError> {
        self.repo
            .get_snapshot(&snapshot_id)
            .await?
            .ok_or(SnapshotError::SnapshotNotFound(snapshot_id))
    }

    /// The most recent checkpoint at `step_index` (highest sequence).
    pub async fn checkpoint_at(
        &self,
        execution_id: Uuid,
        step_index: u32,
    ) -> Result<Option<ExecutionSnapshot>, SnapshotError> {
        let query = SnapshotQuery {
            from_step: Some(step_index),
            to_step: Some(step_index),
            checkpoints_only: true,
        };
        let found = self
            .repo
            .list_snapshots(&execution_id, &query, SnapshotOrder::Step)
            .await?;
        Ok(found.into_iter().max_by_key(|s| s.sequence))
    }

    /// The nearest checkpoint at or before `step_index`.
    pub async fn checkpoint_at_or_before(
        &self,
        execution_id: Uuid,
        step_index: u32,
    ) -> Result<Option<ExecutionSnapshot>, SnapshotError> {
        let query = SnapshotQuery {
            from_step: None,
            to_step: Some(step_index),
            checkpoints_only: true,
        };
        let found = self
            .repo
            .list_snapshots(&execution_id, &query, SnapshotOrder::Step)
            .await?;
        // Step order puts the highest step index, latest sequence, last.
        Ok(found.into_iter().last())
    }
}

// ---------------------------------------------------------------------------
// SnapshotWriter
// ---------------------------------------------------------------------------

/// Exclusive append handle for one execution. Dropping it releases the lock.
pub struct SnapshotWriter<'a, S: SnapshotRepository> {
    repo: &'a S,
    execution_id: Uuid,
    cursor: OwnedMutexGuard<ExecutionCursor>,
}

impl<S: SnapshotRepository> SnapshotWriter<'_, S> {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Step index of the most recent snapshot, if any.
    pub fn last_step_index(&self) -> Option<u32> {
        self.cursor.last_step_index
    }

    /// Append a snapshot, assigning its sequence.
    ///
    /// Rejects a step index below the previous snapshot's unless the new
    /// snapshot is a `rollback`, which opens a new segment at its index.
    /// Rejects NaN and infinite floats, which cannot be stored.
    pub async fn append(&mut self, snapshot: NewSnapshot) -> Result<ExecutionSnapshot, SnapshotError> {
        if snapshot.execution_id != self.execution_id {
            return Err(SnapshotError::Validation(format!(
                "writer for execution {} cannot append to {}",
                self.execution_id, snapshot.execution_id
            )));
        }
        for (part, map) in [("state", &snapshot.state), ("metadata", &snapshot.metadata)] {
            if let Some(key) = first_non_finite(map) {
                return Err(SnapshotError::Validation(format!(
                    "{part} key '{key}' holds a non-finite float"
                )));
            }
        }
        if snapshot.snapshot_type != SnapshotType::Rollback {
            if let Some(last) = self.cursor.last_step_index {
                if snapshot.step_index < last {
                    return Err(SnapshotError::Validation(format!(
                        "step index {} is before the last recorded step index {last}",
                        snapshot.step_index
                    )));
                }
            }
        }

        let record = snapshot.into_snapshot(self.cursor.next_sequence);
        self.repo.append_snapshot(&record).await?;
        self.cursor.next_sequence += 1;
        self.cursor.last_step_index = Some(record.step_index);

        tracing::debug!(
            execution_id = %record.execution_id,
            sequence = record.sequence,
            step_index = record.step_index,
            snapshot_type = %record.snapshot_type,
            "appended snapshot"
        );

        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_types::value::{Value, ValueMap};

    use crate::repository::memory::InMemorySnapshotRepository;

    fn store() -> SnapshotStore<InMemorySnapshotRepository> {
        SnapshotStore::new(InMemorySnapshotRepository::new(), Duration::from_millis(100))
    }

    fn state(n: i64) -> ValueMap {
        let mut m = ValueMap::new();
        m.insert("n".to_string(), Value::from(n));
        m
    }

    #[tokio::test]
    async fn test_sequences_are_strictly_increasing() {
        let store = store();
        let exec = Uuid::now_v7();
        let mut seqs = vec![];
        for step in [0, 0, 1, 1, 2] {
            let snap = store
                .create_snapshot(NewSnapshot::new(exec, step, SnapshotType::StepStart, state(1)))
                .await
                .unwrap();
            seqs.push(snap.sequence);
        }
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_decreasing_step_index_rejected_unless_rollback() {
        let store = store();
        let exec = Uuid::now_v7();
        store
            .create_snapshot(NewSnapshot::new(exec, 3, SnapshotType::StepEnd, state(1)))
            .await
            .unwrap();

        let err = store
            .create_snapshot(NewSnapshot::new(exec, 1, SnapshotType::Manual, state(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let rollback = store
            .create_snapshot(NewSnapshot::new(exec, 1, SnapshotType::Rollback, state(1)))
            .await
            .unwrap();
        assert_eq!(rollback.sequence, 1);

        // The rollback opened a new segment at step 1.
        store
            .create_snapshot(NewSnapshot::new(exec, 1, SnapshotType::StepStart, state(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cursor_is_seeded_from_stored_log() {
        let repo = InMemorySnapshotRepository::new();
        let exec = Uuid::now_v7();
        {
            let first = SnapshotStore::new(repo.clone(), Duration::from_millis(100));
            first
                .create_snapshot(NewSnapshot::new(exec, 2, SnapshotType::StepEnd, state(1)))
                .await
                .unwrap();
        }

        // A fresh store over the same log continues the sequence.
        let second = SnapshotStore::new(repo, Duration::from_millis(100));
        let mut writer = second.lock(exec).await.unwrap();
        assert_eq!(writer.last_step_index(), Some(2));
        let snap = writer
            .append(NewSnapshot::new(exec, 2, SnapshotType::Manual, state(2)))
            .await
            .unwrap();
        assert_eq!(snap.sequence, 1);
    }

    #[tokio::test]
    async fn test_lock_timeout_is_concurrency_conflict() {
        let store = store();
        let exec = Uuid::now_v7();
        let _held = store.lock(exec).await.unwrap();
        let err = store
            .create_snapshot(NewSnapshot::new(exec, 0, SnapshotType::Manual, state(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
    }

    #[tokio::test]
    async fn test_reversed_range_rejected() {
        let store = store();
        let query = SnapshotQuery {
            from_step: Some(4),
            to_step: Some(2),
            checkpoints_only: false,
        };
        let err = store
            .get_execution_snapshots(Uuid::now_v7(), &query)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Validation(_)));
    }

    #[tokio::test]
    async fn test_checkpoint_lookup() {
        let store = store();
        let exec = Uuid::now_v7();
        let older = store
            .create_snapshot(NewSnapshot::new(exec, 1, SnapshotType::Checkpoint, state(1)))
            .await
            .unwrap();
        let newer = store
            .create_snapshot(NewSnapshot::new(exec, 1, SnapshotType::Checkpoint, state(2)))
            .await
            .unwrap();
        store
            .create_snapshot(NewSnapshot::new(exec, 3, SnapshotType::StepEnd, state(3)))
            .await
            .unwrap();

        let at_one = store.checkpoint_at(exec, 1).await.unwrap().unwrap();
        assert_eq!(at_one.id, newer.id);
        assert_ne!(at_one.id, older.id);
        assert!(store.checkpoint_at(exec, 3).await.unwrap().is_none());

        let before_three = store.checkpoint_at_or_before(exec, 3).await.unwrap().unwrap();
        assert_eq!(before_three.id, newer.id);
        assert!(store.checkpoint_at_or_before(exec, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_finite_floats_rejected() {
        let store = store();
        let exec = Uuid::now_v7();
        let mut bad = state(1);
        bad.insert("ratio".to_string(), Value::Float(f64::NAN));

        let err = store
            .create_snapshot(NewSnapshot::new(exec, 0, SnapshotType::Manual, bad))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("ratio"));

        let err = store
            .create_snapshot(
                NewSnapshot::new(exec, 0, SnapshotType::Manual, state(1))
                    .with_meta("score", f64::INFINITY),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("metadata key 'score'"));

        // Nothing was stored, so the sequence starts at zero.
        let ok = store
            .create_snapshot(NewSnapshot::new(exec, 0, SnapshotType::Manual, state(1)))
            .await
            .unwrap();
        assert_eq!(ok.sequence, 0);
    }

    #[tokio::test]
    async fn test_release_prunes_idle_slot_only() {
        let store = store();
        let exec = Uuid::now_v7();
        store
            .create_snapshot(NewSnapshot::new(exec, 0, SnapshotType::StepStart, state(1)))
            .await
            .unwrap();
        assert_eq!(store.lock_slots(), 1);

        let writer = store.lock(exec).await.unwrap();
        assert!(!store.release(exec));
        assert_eq!(store.lock_slots(), 1);
        drop(writer);

        assert!(store.release(exec));
        assert_eq!(store.lock_slots(), 0);

        // A new slot reseeds from the log.
        let snap = store
            .create_snapshot(NewSnapshot::new(exec, 1, SnapshotType::StepEnd, state(2)))
            .await
            .unwrap();
        assert_eq!(snap.sequence, 1);
    }

    #[tokio::test]
    async fn test_get_snapshot_not_found() {
        let store = store();
        let missing = Uuid::now_v7();
        assert!(matches!(
            store.get_snapshot(missing).await,
            Err(SnapshotError::SnapshotNotFound(id)) if id == missing
        ));
    }
}
