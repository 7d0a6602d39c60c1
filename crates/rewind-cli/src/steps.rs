//! Step callbacks registered by the `rewind` binary.
//!
//! The CLI has no business logic of its own: `task` and `parallel` steps copy
//! their resolved input into the execution variables, `condition` steps gate
//! on a boolean, and `wait` uses the built-in sleeper.

use rewind_core::workflow::registry::{
    StepCallback, StepFailure, StepInvocation, StepOutcome, StepRegistry,
};
use rewind_types::value::Value;
use rewind_types::workflow::StepKind;

/// Copies the step's resolved input into the execution variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl StepCallback for PassThrough {
    async fn call(&self, invocation: &StepInvocation) -> Result<StepOutcome, StepFailure> {
        tracing::info!(
            execution_id = %invocation.execution_id,
            step_id = invocation.step.id.as_str(),
            attempt = invocation.attempt,
            keys = invocation.input.len(),
            "running step"
        );
        Ok(StepOutcome {
            updates: invocation.input.clone(),
        })
    }
}

/// Passes when `input.condition` is `true`; fails without retry otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionStep;

impl StepCallback for ConditionStep {
    async fn call(&self, invocation: &StepInvocation) -> Result<StepOutcome, StepFailure> {
        match invocation.input.get("condition") {
            Some(Value::Bool(true)) => Ok(StepOutcome::empty()),
            Some(Value::Bool(false)) => Err(StepFailure::fatal(format!(
                "condition '{}' is false",
                invocation.step.id
            ))),
            Some(other) => Err(StepFailure::fatal(format!(
                "condition '{}' must be a boolean, got {}",
                invocation.step.id,
                other.type_name()
            ))),
            None => Err(StepFailure::fatal(format!(
                "condition '{}' has no `condition` input",
                invocation.step.id
            ))),
        }
    }
}

/// Registry used by every CLI command that drives executions.
pub fn cli_registry() -> StepRegistry {
    let mut registry = StepRegistry::with_builtins();
    registry
        .register(StepKind::Task, PassThrough)
        .register(StepKind::Parallel, PassThrough)
        .register(StepKind::Condition, ConditionStep);
    registry
}
