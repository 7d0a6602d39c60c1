//! Workflow definition types for Rewind.
//!
//! A `WorkflowDefinition` is the read-only description the engine executes:
//! an ordered list of steps with dependency edges, per-step retry policy, and
//! a free-form config map. Definitions are authored as YAML and stored as
//! JSON; both go through these serde derives.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::ValueMap;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable workflow name (alphanumerics, hyphens, underscores).
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lifecycle status. Only `active` workflows can be started.
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Ordered list of step definitions forming the workflow DAG.
    pub steps: Vec<StepDefinition>,
    /// Free-form workflow configuration.
    #[serde(default, skip_serializing_if = "ValueMap::is_empty")]
    pub config: ValueMap,
}

impl WorkflowDefinition {
    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Draft => write!(f, "draft"),
            WorkflowStatus::Active => write!(f, "active"),
            WorkflowStatus::Archived => write!(f, "archived"),
        }
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step ID (e.g. "fetch"). Unique within a workflow.
    pub id: String,
    /// Human-readable step name. Defaults to the ID.
    #[serde(default)]
    pub name: String,
    /// Which registered callback runs this step.
    #[serde(default)]
    pub kind: StepKind,
    /// Input mapping. String values of the form `$path` are resolved against
    /// the execution variables; everything else is passed literally.
    #[serde(default, skip_serializing_if = "ValueMap::is_empty")]
    pub input: ValueMap,
    /// Step IDs this step depends on (DAG edges).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Retry configuration for this step (no retries when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Per-attempt timeout in seconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Write a checkpoint snapshot after this step succeeds.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub checkpoint: bool,
}

impl StepDefinition {
    /// Name for display; falls back to the ID when no name was given.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// The kind of step. The hosting application registers one callback per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Task,
    Condition,
    Parallel,
    Wait,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Task => write!(f, "task"),
            StepKind::Condition => write!(f, "condition"),
            StepKind::Parallel => write!(f, "parallel"),
            StepKind::Wait => write!(f, "wait"),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry configuration for a workflow step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (`2` means up to three attempts).
    #[serde(default)]
    pub max_retries: u32,
    /// Delay between attempts.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self { max_retries, backoff }
    }

    /// Total attempts allowed, counting the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based: the first retry is 1).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff.delay_for(retry)
    }
}

/// Shape of the delay curve between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffShape {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Bounded backoff: `initial_delay_ms` shaped by `shape`, never above `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default)]
    pub shape: BackoffShape,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor for exponential backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            shape: BackoffShape::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl BackoffPolicy {
    /// No delay between attempts.
    pub fn immediate() -> Self {
        Self {
            shape: BackoffShape::Fixed,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let initial = self.initial_delay_ms as f64;
        let raw = match self.shape {
            BackoffShape::Fixed => initial,
            BackoffShape::Linear => initial * f64::from(retry),
            BackoffShape::Exponential => {
                let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
                initial * self.multiplier.max(1.0).powi(exponent)
            }
        };
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    const SAMPLE_YAML: &str = r#"
name: nightly-export
description: Fetch, transform and save the nightly export
status: active
config:
  region: eu-west-1
steps:
  - id: fetch
    input:
      url: "$source.url"
      limit: 500
  - id: transform
    depends_on: [fetch]
    checkpoint: true
  - id: save
    depends_on: [transform]
    retry:
      max_retries: 2
      backoff:
        shape: exponential
        initial_delay_ms: 50
  - id: settle
    kind: wait
    depends_on: [save]
    input:
      duration_ms: 10
"#;

    #[test]
    fn test_parse_yaml_definition() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        assert_eq!(def.name, "nightly-export");
        assert!(def.is_active());
        assert_eq!(def.steps.len(), 4);
        assert_eq!(def.config.get("region"), Some(&Value::from("eu-west-1")));

        let fetch = def.step("fetch").unwrap();
        assert_eq!(fetch.kind, StepKind::Task);
        assert_eq!(fetch.display_name(), "fetch");
        assert_eq!(fetch.input.get("limit"), Some(&Value::Int(500)));

        assert!(def.step("transform").unwrap().checkpoint);

        let save = def.step("save").unwrap();
        let retry = save.retry.as_ref().unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.max_attempts(), 3);
        assert_eq!(retry.backoff.initial_delay_ms, 50);
        assert_eq!(retry.backoff.max_delay_ms, 30_000);

        assert_eq!(def.step("settle").unwrap().kind, StepKind::Wait);
    }

    #[test]
    fn test_status_defaults_to_draft() {
        let def: WorkflowDefinition =
            serde_yaml_ng::from_str("name: x\nsteps:\n  - id: a\n").unwrap();
        assert_eq!(def.status, WorkflowStatus::Draft);
        assert!(!def.is_active());
    }

    #[test]
    fn test_definition_json_roundtrip_keeps_id() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        let json = serde_json::to_string(&def).unwrap();
        let back: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, def.id);
        assert_eq!(back.steps.len(), def.steps.len());
        // Default flags are omitted from the serialized form.
        assert!(!json.contains("\"checkpoint\":false"));
    }

    #[test]
    fn test_exponential_backoff_is_bounded() {
        let backoff = BackoffPolicy {
            shape: BackoffShape::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_linear_and_fixed_backoff() {
        let linear = BackoffPolicy {
            shape: BackoffShape::Linear,
            initial_delay_ms: 100,
            max_delay_ms: 250,
            multiplier: 2.0,
        };
        assert_eq!(linear.delay_for(1), Duration::from_millis(100));
        assert_eq!(linear.delay_for(2), Duration::from_millis(200));
        assert_eq!(linear.delay_for(3), Duration::from_millis(250));

        let fixed = BackoffPolicy {
            shape: BackoffShape::Fixed,
            ..linear
        };
        assert_eq!(fixed.delay_for(7), Duration::from_millis(100));
        assert_eq!(BackoffPolicy::immediate().delay_for(3), Duration::ZERO);
    }

    #[test]
    fn test_step_kind_serde() {
        let kind: StepKind = serde_json::from_str("\"parallel\"").unwrap();
        assert_eq!(kind, StepKind::Parallel);
        assert_eq!(serde_json::to_string(&StepKind::Condition).unwrap(), "\"condition\"");
    }
}
