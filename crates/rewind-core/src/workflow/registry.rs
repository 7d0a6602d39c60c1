//! Step callbacks and the registry that maps step kinds to them.
//!
//! Follows the blanket-impl pattern for dynamic dispatch over an RPITIT trait:
//! 1. `StepCallback` is the ergonomic trait hosts implement (native async fn)
//! 2. `StepCallbackDyn` is its object-safe counterpart with boxed futures
//! 3. A blanket impl bridges every `StepCallback` to `StepCallbackDyn`

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rewind_types::value::{Value, ValueMap};
use rewind_types::workflow::{StepDefinition, StepKind};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Invocation / outcome types
// ---------------------------------------------------------------------------

/// Everything a callback sees for one attempt of one step.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub execution_id: Uuid,
    pub step: StepDefinition,
    pub step_index: u32,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The step's input mapping, resolved against `variables`.
    pub input: ValueMap,
    /// Execution variables when the step was scheduled.
    pub variables: ValueMap,
    /// Fires when the execution leaves `running`.
    pub cancel: CancellationToken,
}

/// Variables a successful step contributes back to the execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub updates: ValueMap,
}

impl StepOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.updates.insert(key.into(), value.into());
        self
    }
}

/// A failed step attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct StepFailure {
    pub message: String,
    /// Whether the retry policy may schedule another attempt.
    pub retryable: bool,
}

impl StepFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Callback traits
// ---------------------------------------------------------------------------

/// A host-supplied implementation of one step kind.
pub trait StepCallback: Send + Sync {
    fn call(
        &self,
        invocation: &StepInvocation,
    ) -> impl Future<Output = Result<StepOutcome, StepFailure>> + Send;
}

/// Object-safe version of [`StepCallback`] with boxed futures.
pub trait StepCallbackDyn: Send + Sync {
    fn call_boxed<'a>(
        &'a self,
        invocation: &'a StepInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepFailure>> + Send + 'a>>;
}

impl<T: StepCallback> StepCallbackDyn for T {
    fn call_boxed<'a>(
        &'a self,
        invocation: &'a StepInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepFailure>> + Send + 'a>> {
        Box::pin(self.call(invocation))
    }
}

// ---------------------------------------------------------------------------
// StepRegistry
// ---------------------------------------------------------------------------

/// Maps each `StepKind` to the callback that runs it.
#[derive(Clone, Default)]
pub struct StepRegistry {
    callbacks: HashMap<StepKind, Arc<dyn StepCallbackDyn>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `wait` callback registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(StepKind::Wait, WaitStep);
        registry
    }

    /// Register (or replace) the callback for a step kind.
    pub fn register<C: StepCallback + 'static>(&mut self, kind: StepKind, callback: C) -> &mut Self {
        self.callbacks.insert(kind, Arc::new(callback));
        self
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepCallbackDyn>> {
        self.callbacks.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StepKind) -> bool {
        self.callbacks.contains_key(&kind)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<String> = self.callbacks.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("StepRegistry").field("kinds", &kinds).finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in callbacks
// ---------------------------------------------------------------------------

/// Sleeps for `input.duration_ms` milliseconds, or until cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitStep;

impl StepCallback for WaitStep {
    async fn call(&self, invocation: &StepInvocation) -> Result<StepOutcome, StepFailure> {
        let millis = match invocation.input.get("duration_ms") {
            None => 0,
            Some(Value::Int(ms)) if *ms >= 0 => *ms as u64,
            Some(other) => {
                return Err(StepFailure::fatal(format!(
                    "wait step '{}': duration_ms must be a non-negative integer, got {other}",
                    invocation.step.id
                )));
            }
        };

        tokio::select! {
            _ = invocation.cancel.cancelled() => {
                Err(StepFailure::fatal("wait cancelled"))
            }
            _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(StepOutcome::empty()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(kind: StepKind, input: ValueMap) -> StepInvocation {
        StepInvocation {
            execution_id: Uuid::now_v7(),
            step: StepDefinition {
                id: "s".to_string(),
                name: String::new(),
                kind,
                input: input.clone(),
                depends_on: vec![],
                retry: None,
                timeout_secs: None,
                checkpoint: false,
            },
            step_index: 0,
            attempt: 1,
            input,
            variables: ValueMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    struct Echo;

    impl StepCallback for Echo {
        async fn call(&self, invocation: &StepInvocation) -> Result<StepOutcome, StepFailure> {
            Ok(StepOutcome {
                updates: invocation.input.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_registered_callback_is_dispatched_dynamically() {
        let mut registry = StepRegistry::new();
        registry.register(StepKind::Task, Echo);
        assert!(registry.contains(StepKind::Task));
        assert!(registry.get(StepKind::Condition).is_none());

        let mut input = ValueMap::new();
        input.insert("k".to_string(), Value::from("v"));
        let inv = invocation(StepKind::Task, input.clone());
        let outcome = registry.get(StepKind::Task).unwrap().call_boxed(&inv).await.unwrap();
        assert_eq!(outcome.updates, input);
    }

    #[tokio::test]
    async fn test_wait_step_sleeps() {
        let registry = StepRegistry::with_builtins();
        let mut input = ValueMap::new();
        input.insert("duration_ms".to_string(), Value::from(5));
        let inv = invocation(StepKind::Wait, input);

        let started = std::time::Instant::now();
        let outcome = registry.get(StepKind::Wait).unwrap().call_boxed(&inv).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(5));
        assert_eq!(outcome, StepOutcome::empty());
    }

    #[tokio::test]
    async fn test_wait_step_observes_cancellation() {
        let mut input = ValueMap::new();
        input.insert("duration_ms".to_string(), Value::from(60_000));
        let inv = invocation(StepKind::Wait, input);
        inv.cancel.cancel();
        let err = WaitStep.call(&inv).await.unwrap_err();
        assert!(err.message.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_wait_step_rejects_bad_duration() {
        let mut input = ValueMap::new();
        input.insert("duration_ms".to_string(), Value::from("soon"));
        let err = WaitStep.call(&invocation(StepKind::Wait, input)).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[test]
    fn test_outcome_builder() {
        let outcome = StepOutcome::empty().set("count", 3).set("ok", true);
        assert_eq!(outcome.updates.get("count"), Some(&Value::Int(3)));
        assert_eq!(outcome.updates.len(), 2);
    }
}
