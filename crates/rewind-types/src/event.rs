//! Execution lifecycle events broadcast by the engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events published on the engine's event bus.
///
/// Subscribers (CLI progress output, tests) should treat these as
/// notifications; the snapshot log is the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: Uuid,
        total_steps: u32,
    },
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        step_index: u32,
        attempt: u32,
    },
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        step_index: u32,
        duration_ms: u64,
    },
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        step_index: u32,
        error: String,
        will_retry: bool,
    },
    ExecutionPaused {
        execution_id: Uuid,
        step_index: u32,
    },
    ExecutionResumed {
        execution_id: Uuid,
        step_index: u32,
    },
    ExecutionRolledBack {
        execution_id: Uuid,
        from_step_index: u32,
        to_step_index: u32,
    },
    ExecutionCompleted {
        execution_id: Uuid,
    },
    ExecutionFailed {
        execution_id: Uuid,
        error: String,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::StepStarted { execution_id, .. }
            | ExecutionEvent::StepCompleted { execution_id, .. }
            | ExecutionEvent::StepFailed { execution_id, .. }
            | ExecutionEvent::ExecutionPaused { execution_id, .. }
            | ExecutionEvent::ExecutionResumed { execution_id, .. }
            | ExecutionEvent::ExecutionRolledBack { execution_id, .. }
            | ExecutionEvent::ExecutionCompleted { execution_id }
            | ExecutionEvent::ExecutionFailed { execution_id, .. } => *execution_id,
        }
    }
}
