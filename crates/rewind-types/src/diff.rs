//! Diff and comparison result types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

/// A key present on both sides whose value differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueChange {
    pub key: String,
    pub before: Value,
    pub after: Value,
}

/// Difference between two maps, taken from `a` to `b`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapDiff {
    /// Keys only in `b`, with their value.
    pub added: Vec<(String, Value)>,
    /// Keys only in `a`, with their value.
    pub removed: Vec<(String, Value)>,
    pub changed: Vec<ValueChange>,
}

impl MapDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }

    /// The same diff taken from `b` to `a`.
    pub fn inverted(&self) -> MapDiff {
        MapDiff {
            added: self.removed.clone(),
            removed: self.added.clone(),
            changed: self
                .changed
                .iter()
                .map(|c| ValueChange {
                    key: c.key.clone(),
                    before: c.after.clone(),
                    after: c.before.clone(),
                })
                .collect(),
        }
    }
}

/// Result of comparing two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub snapshot_a: Uuid,
    pub snapshot_b: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<MapDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MapDiff>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.state.as_ref().is_none_or(MapDiff::is_empty)
            && self.metadata.as_ref().is_none_or(MapDiff::is_empty)
    }
}

/// Output rendering for a diff. Never affects what is computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffFormat {
    #[default]
    Json,
    Text,
    Summary,
}

impl std::str::FromStr for DiffFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(DiffFormat::Json),
            "text" => Ok(DiffFormat::Text),
            "summary" => Ok(DiffFormat::Summary),
            other => Err(format!("unknown diff format: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareOptions {
    #[serde(default = "default_true")]
    pub include_state_diff: bool,
    #[serde(default)]
    pub include_metadata_diff: bool,
    #[serde(default)]
    pub format: DiffFormat,
}

fn default_true() -> bool {
    true
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            include_state_diff: true,
            include_metadata_diff: false,
            format: DiffFormat::default(),
        }
    }
}

/// One aligned step index in an execution comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepComparison {
    pub step_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_a: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_b: Option<Uuid>,
    /// Present when both sides have a snapshot at this index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<SnapshotDiff>,
    pub differs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSummary {
    pub steps_compared: u32,
    pub steps_differing: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_divergence_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionComparison {
    pub execution_a: Uuid,
    pub execution_b: Uuid,
    pub steps: Vec<StepComparison>,
    pub summary: ComparisonSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverted_swaps_sides() {
        let diff = MapDiff {
            added: vec![("new".to_string(), Value::from(1))],
            removed: vec![],
            changed: vec![ValueChange {
                key: "count".to_string(),
                before: Value::from(1),
                after: Value::from(2),
            }],
        };
        let inv = diff.inverted();
        assert!(inv.added.is_empty());
        assert_eq!(inv.removed, diff.added);
        assert_eq!(inv.changed[0].before, Value::from(2));
        assert_eq!(inv.inverted(), diff);
        assert_eq!(diff.change_count(), 2);
    }

    #[test]
    fn test_compare_options_defaults() {
        let opts: CompareOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.include_state_diff);
        assert!(!opts.include_metadata_diff);
        assert_eq!(opts.format, DiffFormat::Json);
    }

    #[test]
    fn test_snapshot_diff_empty_when_sections_absent() {
        let diff = SnapshotDiff {
            snapshot_a: Uuid::now_v7(),
            snapshot_b: Uuid::now_v7(),
            state: Some(MapDiff::default()),
            metadata: None,
        };
        assert!(diff.is_empty());
    }
}
