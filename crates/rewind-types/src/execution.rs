//! Execution records: one run instance of a workflow definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::ValueMap;

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    /// Transient: the execution is being repositioned onto a checkpoint.
    RolledBack,
}

impl ExecutionStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `completed` and `failed` only leave through a rollback (or, for
    /// `failed`, a resume).
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Failed, Running)
                | (Running, RolledBack)
                | (Paused, RolledBack)
                | (Failed, RolledBack)
                | (Completed, RolledBack)
                | (RolledBack, Running)
        )
    }

    /// Completed or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "paused" => Ok(ExecutionStatus::Paused),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "rolled_back" => Ok(ExecutionStatus::RolledBack),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub triggered_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
    pub status: ExecutionStatus,
    /// Index of the next step to run in the planned step order.
    pub current_step_index: u32,
    pub total_steps: u32,
    pub variables: ValueMap,
    /// Fraction of steps done, `0.0..=1.0`.
    pub progress: f64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Execution {
    /// A fresh `pending` execution at step 0.
    pub fn new(
        workflow_id: Uuid,
        triggered_by: impl Into<String>,
        parent_execution_id: Option<Uuid>,
        total_steps: u32,
        variables: ValueMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            triggered_by: triggered_by.into(),
            parent_execution_id,
            status: ExecutionStatus::Pending,
            current_step_index: 0,
            total_steps,
            variables,
            progress: 0.0,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    /// Recompute `progress` from the cursor.
    pub fn refresh_progress(&mut self) {
        self.progress = if self.status == ExecutionStatus::Completed || self.total_steps == 0 {
            1.0
        } else {
            (f64::from(self.current_step_index) / f64::from(self.total_steps)).clamp(0.0, 1.0)
        };
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn progress_report(&self) -> ExecutionProgress {
        ExecutionProgress {
            execution_id: self.id,
            percent: (self.progress * 100.0).clamp(0.0, 100.0),
            current_step_index: self.current_step_index,
            total_steps: self.total_steps,
            status: self.status,
        }
    }
}

/// Result of `get_progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub execution_id: Uuid,
    /// `0.0..=100.0`.
    pub percent: f64,
    pub current_step_index: u32,
    pub total_steps: u32,
    pub status: ExecutionStatus,
}

/// Filter for listing executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

impl Default for ExecutionFilter {
    fn default() -> Self {
        Self {
            workflow_id: None,
            status: None,
            limit: default_limit(),
        }
    }
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &Execution) -> bool {
        self.workflow_id.is_none_or(|w| execution.workflow_id == w)
            && self.status.is_none_or(|s| execution.status == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Failed.can_transition_to(Running));
        assert!(Completed.can_transition_to(RolledBack));
        assert!(RolledBack.can_transition_to(Running));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(RolledBack));
        assert!(!RolledBack.can_transition_to(Completed));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Paused,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::RolledBack,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("halted".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_progress_tracks_cursor() {
        let mut exec = Execution::new(Uuid::now_v7(), "test", None, 4, ValueMap::new());
        exec.refresh_progress();
        assert_eq!(exec.progress, 0.0);

        exec.current_step_index = 1;
        exec.refresh_progress();
        assert_eq!(exec.progress_report().percent, 25.0);

        exec.status = ExecutionStatus::Completed;
        exec.refresh_progress();
        assert_eq!(exec.progress, 1.0);
    }

    #[test]
    fn test_zero_steps_is_fully_progressed() {
        let mut exec = Execution::new(Uuid::now_v7(), "test", None, 0, ValueMap::new());
        exec.refresh_progress();
        assert_eq!(exec.progress, 1.0);
    }

    #[test]
    fn test_filter_matches() {
        let wf = Uuid::now_v7();
        let mut exec = Execution::new(wf, "test", None, 1, ValueMap::new());
        exec.status = ExecutionStatus::Failed;

        assert!(ExecutionFilter::default().matches(&exec));
        let filter = ExecutionFilter {
            workflow_id: Some(wf),
            status: Some(ExecutionStatus::Failed),
            limit: 10,
        };
        assert!(filter.matches(&exec));
        let filter = ExecutionFilter {
            status: Some(ExecutionStatus::Running),
            ..filter
        };
        assert!(!filter.matches(&exec));
    }
}
