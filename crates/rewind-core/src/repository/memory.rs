//! In-memory repository implementations.
//!
//! Cloneable handles over `tokio::sync::RwLock`-guarded maps. Used by tests
//! and by hosts that embed the engine without durable storage.

use std::collections::HashMap;
use std::sync::Arc;

use rewind_types::error::RepositoryError;
use rewind_types::execution::{Execution, ExecutionFilter};
use rewind_types::snapshot::{ExecutionSnapshot, SnapshotOrder, SnapshotQuery};
use rewind_types::workflow::WorkflowDefinition;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::execution::ExecutionRepository;
use super::snapshot::SnapshotRepository;
use super::workflow::WorkflowDefinitionStore;

// ---------------------------------------------------------------------------
// Workflow definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowStore {
    definitions: Arc<RwLock<HashMap<Uuid, WorkflowDefinition>>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a definition by ID.
    pub async fn insert(&self, definition: WorkflowDefinition) {
        self.definitions
            .write()
            .await
            .insert(definition.id, definition);
    }
}

impl WorkflowDefinitionStore for InMemoryWorkflowStore {
    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.read().await.get(id).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<_> = self.definitions.read().await.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryExecutionRepository {
    executions: Arc<RwLock<HashMap<Uuid, Execution>>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut map = self.executions.write().await;
        if map.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        map.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut map = self.executions.write().await;
        match map.get_mut(&execution.id) {
            Some(slot) => {
                *slot = execution.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let map = self.executions.read().await;
        let mut matching: Vec<Execution> =
            map.values().filter(|e| filter.matches(e)).cloned().collect();
        matching.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        matching.truncate(filter.limit as usize);
        Ok(matching)
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SnapshotLog {
    /// Per-execution snapshots in append order.
    by_execution: HashMap<Uuid, Vec<ExecutionSnapshot>>,
    /// Snapshot ID -> owning execution.
    owners: HashMap<Uuid, Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotRepository {
    log: Arc<RwLock<SnapshotLog>>,
}

impl InMemorySnapshotRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotRepository for InMemorySnapshotRepository {
    async fn append_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<(), RepositoryError> {
        let mut log = self.log.write().await;
        let entries = log.by_execution.entry(snapshot.execution_id).or_default();
        if entries.iter().any(|s| s.sequence == snapshot.sequence) {
            return Err(RepositoryError::Conflict(format!(
                "sequence {} already used for execution {}",
                snapshot.sequence, snapshot.execution_id
            )));
        }
        entries.push(snapshot.clone());
        log.owners.insert(snapshot.id, snapshot.execution_id);
        Ok(())
    }

    async fn get_snapshot(&self, id: &Uuid) -> Result<Option<ExecutionSnapshot>, RepositoryError> {
        let log = self.log.read().await;
        let Some(execution_id) = log.owners.get(id) else {
            return Ok(None);
        };
        Ok(log
            .by_execution
            .get(execution_id)
            .and_then(|entries| entries.iter().find(|s| s.id == *id))
            .cloned())
    }

    async fn list_snapshots(
        &self,
        execution_id: &Uuid,
        query: &SnapshotQuery,
        order: SnapshotOrder,
    ) -> Result<Vec<ExecutionSnapshot>, RepositoryError> {
        let log = self.log.read().await;
        let mut out: Vec<ExecutionSnapshot> = log
            .by_execution
            .get(execution_id)
            .map(|entries| entries.iter().filter(|s| query.matches(s)).cloned().collect())
            .unwrap_or_default();
        match order {
            SnapshotOrder::Step => out.sort_by_key(|s| (s.step_index, s.sequence)),
            SnapshotOrder::Creation => out.sort_by_key(|s| s.sequence),
        }
        Ok(out)
    }

    async fn latest_snapshot(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<ExecutionSnapshot>, RepositoryError> {
        let log = self.log.read().await;
        Ok(log
            .by_execution
            .get(execution_id)
            .and_then(|entries| entries.iter().max_by_key(|s| s.sequence))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rewind_types::execution::ExecutionStatus;
    use rewind_types::snapshot::{NewSnapshot, SnapshotType};
    use rewind_types::value::ValueMap;

    fn execution_at(workflow_id: Uuid, status: ExecutionStatus, minutes_ago: i64) -> Execution {
        let mut e = Execution::new(workflow_id, "test", None, 3, ValueMap::new());
        e.status = status;
        e.started_at = Utc::now() - Duration::minutes(minutes_ago);
        e
    }

    #[tokio::test]
    async fn test_execution_create_get_update() {
        let repo = InMemoryExecutionRepository::new();
        let mut e = execution_at(Uuid::now_v7(), ExecutionStatus::Pending, 0);
        repo.create_execution(&e).await.unwrap();
        assert!(matches!(
            repo.create_execution(&e).await,
            Err(RepositoryError::Conflict(_))
        ));

        e.status = ExecutionStatus::Running;
        repo.update_execution(&e).await.unwrap();
        let got = repo.get_execution(&e.id).await.unwrap().unwrap();
        assert_eq!(got.status, ExecutionStatus::Running);

        let ghost = execution_at(Uuid::now_v7(), ExecutionStatus::Pending, 0);
        assert!(matches!(
            repo.update_execution(&ghost).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_executions_filters_and_orders_newest_first() {
        let repo = InMemoryExecutionRepository::new();
        let wf = Uuid::now_v7();
        let other_wf = Uuid::now_v7();

        let old_failed = execution_at(wf, ExecutionStatus::Failed, 30);
        let new_failed = execution_at(wf, ExecutionStatus::Failed, 1);
        let completed = execution_at(wf, ExecutionStatus::Completed, 5);
        let other = execution_at(other_wf, ExecutionStatus::Failed, 2);
        for e in [&old_failed, &new_failed, &completed, &other] {
            repo.create_execution(e).await.unwrap();
        }

        let filter = ExecutionFilter {
            workflow_id: Some(wf),
            status: Some(ExecutionStatus::Failed),
            limit: 10,
        };
        let listed = repo.list_executions(&filter).await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![new_failed.id, old_failed.id]);

        let capped = repo
            .list_executions(&ExecutionFilter {
                limit: 1,
                ..ExecutionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, new_failed.id);

        let none = repo
            .list_executions(&ExecutionFilter {
                limit: 0,
                ..ExecutionFilter::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_append_rejects_duplicate_sequence() {
        let repo = InMemorySnapshotRepository::new();
        let exec = Uuid::now_v7();
        let first = NewSnapshot::new(exec, 0, SnapshotType::StepStart, ValueMap::new())
            .into_snapshot(0);
        repo.append_snapshot(&first).await.unwrap();

        let dup = NewSnapshot::new(exec, 0, SnapshotType::StepEnd, ValueMap::new())
            .into_snapshot(0);
        assert!(matches!(
            repo.append_snapshot(&dup).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert_eq!(repo.get_snapshot(&first.id).await.unwrap(), Some(first));
        assert!(repo.get_snapshot(&dup.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_snapshots_orders_and_filters() {
        let repo = InMemorySnapshotRepository::new();
        let exec = Uuid::now_v7();
        // Step 2 written, then a rollback to 0, then step 1.
        let writes = [
            (2, SnapshotType::Checkpoint),
            (0, SnapshotType::Rollback),
            (1, SnapshotType::StepEnd),
        ];
        for (seq, (step, ty)) in writes.into_iter().enumerate() {
            let snap = NewSnapshot::new(exec, step, ty, ValueMap::new()).into_snapshot(seq as u64);
            repo.append_snapshot(&snap).await.unwrap();
        }

        let by_step = repo
            .list_snapshots(&exec, &SnapshotQuery::default(), SnapshotOrder::Step)
            .await
            .unwrap();
        let steps: Vec<u32> = by_step.iter().map(|s| s.step_index).collect();
        assert_eq!(steps, vec![0, 1, 2]);

        let by_creation = repo
            .list_snapshots(&exec, &SnapshotQuery::default(), SnapshotOrder::Creation)
            .await
            .unwrap();
        let steps: Vec<u32> = by_creation.iter().map(|s| s.step_index).collect();
        assert_eq!(steps, vec![2, 0, 1]);

        let checkpoints = repo
            .list_snapshots(&exec, &SnapshotQuery::checkpoints(), SnapshotOrder::Step)
            .await
            .unwrap();
        assert_eq!(checkpoints.len(), 1);

        let latest = repo.latest_snapshot(&exec).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert!(repo.latest_snapshot(&Uuid::now_v7()).await.unwrap().is_none());
    }
}
