//! The append-only snapshot log and the read models built from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::{Value, ValueMap};

/// Why a snapshot was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    StepStart,
    StepEnd,
    Checkpoint,
    Error,
    Rollback,
    Manual,
}

impl SnapshotType {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotType::StepStart => "step_start",
            SnapshotType::StepEnd => "step_end",
            SnapshotType::Checkpoint => "checkpoint",
            SnapshotType::Error => "error",
            SnapshotType::Rollback => "rollback",
            SnapshotType::Manual => "manual",
        }
    }
}

impl std::fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SnapshotType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step_start" => Ok(SnapshotType::StepStart),
            "step_end" => Ok(SnapshotType::StepEnd),
            "checkpoint" => Ok(SnapshotType::Checkpoint),
            "error" => Ok(SnapshotType::Error),
            "rollback" => Ok(SnapshotType::Rollback),
            "manual" => Ok(SnapshotType::Manual),
            other => Err(format!("unknown snapshot type: {other}")),
        }
    }
}

/// An immutable recorded state of an execution at a step index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// Per-execution creation counter, strictly increasing from 0.
    pub sequence: u64,
    pub step_index: u32,
    pub timestamp: DateTime<Utc>,
    pub snapshot_type: SnapshotType,
    /// Copy of the execution variables at write time.
    pub state: ValueMap,
    #[serde(default)]
    pub metadata: ValueMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_checkpoint: bool,
}

impl ExecutionSnapshot {
    /// The `step_id` the engine records in metadata, if any.
    pub fn step_id(&self) -> Option<&str> {
        self.metadata.get("step_id").and_then(Value::as_str)
    }
}

/// Input to `create_snapshot`. Sequence, id and timestamp are assigned on append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub execution_id: Uuid,
    pub step_index: u32,
    pub snapshot_type: SnapshotType,
    #[serde(default)]
    pub state: ValueMap,
    #[serde(default)]
    pub metadata: ValueMap,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_checkpoint: bool,
}

impl NewSnapshot {
    pub fn new(
        execution_id: Uuid,
        step_index: u32,
        snapshot_type: SnapshotType,
        state: ValueMap,
    ) -> Self {
        Self {
            execution_id,
            step_index,
            snapshot_type,
            state,
            metadata: ValueMap::new(),
            description: None,
            is_checkpoint: snapshot_type == SnapshotType::Checkpoint,
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn checkpoint(mut self, is_checkpoint: bool) -> Self {
        self.is_checkpoint = is_checkpoint;
        self
    }

    /// Materialize the record with its assigned identity.
    pub fn into_snapshot(self, sequence: u64) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id: Uuid::now_v7(),
            execution_id: self.execution_id,
            sequence,
            step_index: self.step_index,
            timestamp: Utc::now(),
            // Checkpoint-type snapshots are always rollback targets.
            is_checkpoint: self.is_checkpoint || self.snapshot_type == SnapshotType::Checkpoint,
            snapshot_type: self.snapshot_type,
            state: self.state,
            metadata: self.metadata,
            description: self.description,
        }
    }
}

/// Range filter for `get_execution_snapshots`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotQuery {
    #[serde(default)]
    pub from_step: Option<u32>,
    #[serde(default)]
    pub to_step: Option<u32>,
    #[serde(default)]
    pub checkpoints_only: bool,
}

impl SnapshotQuery {
    pub fn checkpoints() -> Self {
        Self {
            checkpoints_only: true,
            ..Self::default()
        }
    }

    pub fn is_reversed(&self) -> bool {
        matches!((self.from_step, self.to_step), (Some(from), Some(to)) if from > to)
    }

    pub fn matches(&self, snapshot: &ExecutionSnapshot) -> bool {
        self.from_step.is_none_or(|from| snapshot.step_index >= from)
            && self.to_step.is_none_or(|to| snapshot.step_index <= to)
            && (!self.checkpoints_only || snapshot.is_checkpoint)
    }
}

/// Ordering of a snapshot listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SnapshotOrder {
    /// `step_index`, then `sequence`.
    #[default]
    Step,
    /// `sequence` only.
    Creation,
}

/// One entry in an execution timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub snapshot_id: Uuid,
    pub sequence: u64,
    pub step_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub snapshot_type: SnapshotType,
    pub timestamp: DateTime<Utc>,
    /// Elapsed time since the matching `step_start` (end and error entries only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_since_step_start_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(step_index: u32, is_checkpoint: bool) -> ExecutionSnapshot {
        NewSnapshot::new(Uuid::now_v7(), step_index, SnapshotType::StepEnd, ValueMap::new())
            .checkpoint(is_checkpoint)
            .into_snapshot(0)
    }

    #[test]
    fn test_checkpoint_type_is_always_flagged() {
        let snap = NewSnapshot::new(Uuid::now_v7(), 2, SnapshotType::Checkpoint, ValueMap::new())
            .checkpoint(false)
            .into_snapshot(5);
        assert!(snap.is_checkpoint);
        assert_eq!(snap.sequence, 5);
        assert_eq!(snap.step_index, 2);
    }

    #[test]
    fn test_metadata_builder_and_step_id() {
        let snap = NewSnapshot::new(Uuid::now_v7(), 0, SnapshotType::StepStart, ValueMap::new())
            .with_meta("step_id", "fetch")
            .with_meta("attempt", 1)
            .with_description("first")
            .into_snapshot(0);
        assert_eq!(snap.step_id(), Some("fetch"));
        assert_eq!(snap.metadata.get("attempt"), Some(&Value::Int(1)));
        assert_eq!(snap.description.as_deref(), Some("first"));
        assert!(!snap.is_checkpoint);
    }

    #[test]
    fn test_query_range_and_checkpoints() {
        let q = SnapshotQuery {
            from_step: Some(1),
            to_step: Some(2),
            checkpoints_only: false,
        };
        assert!(!q.matches(&snapshot(0, false)));
        assert!(q.matches(&snapshot(1, false)));
        assert!(q.matches(&snapshot(2, true)));
        assert!(!q.matches(&snapshot(3, false)));

        let q = SnapshotQuery::checkpoints();
        assert!(q.matches(&snapshot(7, true)));
        assert!(!q.matches(&snapshot(7, false)));
    }

    #[test]
    fn test_reversed_range_detection() {
        let q = SnapshotQuery {
            from_step: Some(3),
            to_step: Some(1),
            checkpoints_only: false,
        };
        assert!(q.is_reversed());
        assert!(!SnapshotQuery::default().is_reversed());
    }

    #[test]
    fn test_snapshot_type_serde() {
        let json = serde_json::to_string(&SnapshotType::StepStart).unwrap();
        assert_eq!(json, "\"step_start\"");
        assert_eq!("rollback".parse::<SnapshotType>().unwrap(), SnapshotType::Rollback);
    }
}
