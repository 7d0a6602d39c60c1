//! Read-only time-travel queries over the snapshot log.
//!
//! `TimeTravelService` never mutates anything and never takes execution
//! locks; rollbacks go through the engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use rewind_types::diff::{
    CompareOptions, ComparisonSummary, ExecutionComparison, SnapshotDiff, StepComparison,
};
use rewind_types::snapshot::{ExecutionSnapshot, SnapshotQuery, TimelineEntry};
use uuid::Uuid;

use super::diff::diff_snapshots;
use super::store::{SnapshotError, SnapshotStore};
use super::timeline::build_timeline;
use crate::repository::execution::ExecutionRepository;
use crate::repository::snapshot::SnapshotRepository;

pub struct TimeTravelService<E: ExecutionRepository, S: SnapshotRepository> {
    executions: E,
    snapshots: Arc<SnapshotStore<S>>,
}

impl<E: ExecutionRepository, S: SnapshotRepository> TimeTravelService<E, S> {
    pub fn new(executions: E, snapshots: Arc<SnapshotStore<S>>) -> Self {
        Self {
            executions,
            snapshots,
        }
    }

    async fn ensure_execution(&self, execution_id: Uuid) -> Result<(), SnapshotError> {
        match self.executions.get_execution(&execution_id).await? {
            Some(_) => Ok(()),
            None => Err(SnapshotError::ExecutionNotFound(execution_id)),
        }
    }

    /// Snapshots of an execution ordered by step index, then creation.
    pub async fn get_execution_snapshots(
        &self,
        execution_id: Uuid,
        query: &SnapshotQuery,
    ) -> Result<Vec<ExecutionSnapshot>, SnapshotError> {
        self.ensure_execution(execution_id).await?;
        self.snapshots.get_execution_snapshots(execution_id, query).await
    }

    pub async fn get_snapshot(&self, snapshot_id: Uuid) -> Result<ExecutionSnapshot, SnapshotError> {
        self.snapshots.get_snapshot(snapshot_id).await
    }

    pub async fn get_execution_timeline(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<TimelineEntry>, SnapshotError> {
        self.ensure_execution(execution_id).await?;
        let log = self.snapshots.get_snapshot_log(execution_id).await?;
        Ok(build_timeline(&log))
    }

    pub async fn compare_snapshots(
        &self,
        snapshot_a: Uuid,
        snapshot_b: Uuid,
        options: &CompareOptions,
    ) -> Result<SnapshotDiff, SnapshotError> {
        let a = self.snapshots.get_snapshot(snapshot_a).await?;
        let b = self.snapshots.get_snapshot(snapshot_b).await?;
        Ok(diff_snapshots(&a, &b, options))
    }

    /// Diff each consecutive pair of `snapshot_ids`.
    pub async fn compare_snapshot_ids(
        &self,
        snapshot_ids: &[Uuid],
        options: &CompareOptions,
    ) -> Result<Vec<SnapshotDiff>, SnapshotError> {
        if snapshot_ids.len() < 2 {
            return Err(SnapshotError::Validation(format!(
                "at least two snapshot ids are required, got {}",
                snapshot_ids.len()
            )));
        }

        let mut resolved = Vec::with_capacity(snapshot_ids.len());
        for id in snapshot_ids {
            resolved.push(self.snapshots.get_snapshot(*id).await?);
        }
        Ok(resolved
            .windows(2)
            .map(|pair| diff_snapshots(&pair[0], &pair[1], options))
            .collect())
    }

    /// Align two executions step by step and find where they diverge.
    ///
    /// Each log is reduced to its latest snapshot per step index. Indices
    /// present on both sides are diffed on state; an index present on only
    /// one side counts as differing.
    pub async fn compare_executions(
        &self,
        execution_a: Uuid,
        execution_b: Uuid,
    ) -> Result<ExecutionComparison, SnapshotError> {
        self.ensure_execution(execution_a).await?;
        self.ensure_execution(execution_b).await?;

        let latest_a = self.latest_per_step(execution_a).await?;
        let latest_b = self.latest_per_step(execution_b).await?;
        let span = |m: &BTreeMap<u32, ExecutionSnapshot>| {
            m.keys().next_back().map_or(0, |last| last + 1)
        };
        let len = span(&latest_a).max(span(&latest_b));

        let options = CompareOptions::default();
        let mut steps = Vec::with_capacity(len as usize);
        for step_index in 0..len {
            let a = latest_a.get(&step_index);
            let b = latest_b.get(&step_index);
            let (diff, differs) = match (a, b) {
                (Some(a), Some(b)) => {
                    let diff = diff_snapshots(a, b, &options);
                    let differs = !diff.is_empty();
                    (Some(diff), differs)
                }
                (None, None) => (None, false),
                _ => (None, true),
            };
            steps.push(StepComparison {
                step_index,
                snapshot_a: a.map(|s| s.id),
                snapshot_b: b.map(|s| s.id),
                diff,
                differs,
            });
        }

        let summary = ComparisonSummary {
            steps_compared: len,
            steps_differing: steps.iter().filter(|s| s.differs).count() as u32,
            first_divergence_index: steps.iter().find(|s| s.differs).map(|s| s.step_index),
        };

        tracing::debug!(
            execution_a = %execution_a,
            execution_b = %execution_b,
            steps_compared = summary.steps_compared,
            first_divergence = ?summary.first_divergence_index,
            "compared executions"
        );

        Ok(ExecutionComparison {
            execution_a,
            execution_b,
            steps,
            summary,
        })
    }

    async fn latest_per_step(
        &self,
        execution_id: Uuid,
    ) -> Result<BTreeMap<u32, ExecutionSnapshot>, SnapshotError> {
        let log = self.snapshots.get_snapshot_log(execution_id).await?;
        // Creation order: later snapshots replace earlier ones.
        Ok(log.into_iter().map(|s| (s.step_index, s)).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
