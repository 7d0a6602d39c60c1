//! Runs single step attempts: input resolution, timeout, and cancellation.
//!
//! Retry scheduling lives with the caller (see `retry::RetryTracker`); this
//! module only turns one invocation into one `AttemptResult`.

use std::time::Duration;

use rewind_types::value::{Value, ValueMap, lookup_path};

use super::registry::{StepFailure, StepInvocation, StepOutcome, StepRegistry};

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Succeeded(StepOutcome),
    Failed(StepFailure),
    /// The execution left `running` mid-attempt. Nothing is recorded.
    Cancelled,
}

/// Dispatches attempts to the registered callbacks.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    registry: StepRegistry,
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(registry: StepRegistry, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Run one attempt of `invocation.step`.
    ///
    /// A missing callback is a non-retryable failure; a timeout is retryable.
    pub async fn run_attempt(&self, invocation: &StepInvocation) -> AttemptResult {
        let step = &invocation.step;
        let Some(callback) = self.registry.get(step.kind) else {
            return AttemptResult::Failed(StepFailure::fatal(format!(
                "no callback registered for step kind '{}'",
                step.kind
            )));
        };

        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        tokio::select! {
            biased;
            _ = invocation.cancel.cancelled() => AttemptResult::Cancelled,
            result = tokio::time::timeout(timeout, callback.call_boxed(invocation)) => match result {
                Ok(Ok(outcome)) => AttemptResult::Succeeded(outcome),
                Ok(Err(failure)) => AttemptResult::Failed(failure),
                Err(_elapsed) => AttemptResult::Failed(StepFailure::retryable(format!(
                    "step '{}' timed out after {}ms",
                    step.id,
                    timeout.as_millis()
                ))),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Input mapping
// ---------------------------------------------------------------------------

/// Resolve a step's input mapping against the execution variables.
///
/// A string `"$a.b.0"` is replaced by the variable at that dotted path;
/// `"$$text"` yields the literal `"$text"`. Maps and arrays are resolved
/// recursively, everything else is passed through. An unresolvable reference
/// is a non-retryable failure.
pub fn resolve_input(mapping: &ValueMap, variables: &ValueMap) -> Result<ValueMap, StepFailure> {
    mapping
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(key, value, variables)?)))
        .collect()
}

fn resolve_value(key: &str, value: &Value, variables: &ValueMap) -> Result<Value, StepFailure> {
    match value {
        Value::String(s) if s.starts_with("$$") => Ok(Value::String(s[1..].to_string())),
        Value::String(s) if s.starts_with('$') => {
            let path = &s[1..];
            lookup_path(variables, path).cloned().ok_or_else(|| {
                StepFailure::fatal(format!(
                    "input '{key}' references unknown variable '{path}'"
                ))
            })
        }
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(key, item, variables))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Map(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_value(key, v, variables)?)))
            .collect::<Result<ValueMap, StepFailure>>()
            .map(Value::Map),
        other => Ok(other.clone()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_types::workflow::{StepDefinition, StepKind};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use crate::workflow::registry::StepCallback;

    fn vars(json: serde_json::Value) -> ValueMap {
        match Value::from(json) {
            Value::Map(map) => map,
            other => panic!("expected map, got {other:?}"),
        }
    }

    fn invocation(kind: StepKind, timeout_secs: Option<u64>) -> StepInvocation {
        StepInvocation {
            execution_id: Uuid::now_v7(),
            step: StepDefinition {
                id: "slow".to_string(),
                name: String::new(),
                kind,
                input: ValueMap::new(),
                depends_on: vec![],
                retry: None,
                timeout_secs,
                checkpoint: false,
            },
            step_index: 0,
            attempt: 1,
            input: ValueMap::new(),
            variables: ValueMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    struct Hang;

    impl StepCallback for Hang {
        async fn call(&self, _invocation: &StepInvocation) -> Result<StepOutcome, StepFailure> {
            std::future::pending::<()>().await;
            Ok(StepOutcome::empty())
        }
    }

    struct Flaky;

    impl StepCallback for Flaky {
        async fn call(&self, _invocation: &StepInvocation) -> Result<StepOutcome, StepFailure> {
            Err(StepFailure::retryable("connection reset"))
        }
    }

    #[test]
    fn test_resolve_input_paths_and_literals() {
        let variables = vars(serde_json::json!({
            "source": {"url": "https://example.test/feed", "tags": ["a", "b"]},
            "limit": 10
        }));
        let mapping = vars(serde_json::json!({
            "url": "$source.url",
            "first_tag": "$source.tags.0",
            "limit": "$limit",
            "price": "$$5",
            "literal": 42,
            "nested": {"inner": "$limit", "list": ["$source.tags.1", true]}
        }));

        let resolved = resolve_input(&mapping, &variables).unwrap();
        assert_eq!(resolved["url"], Value::from("https://example.test/feed"));
        assert_eq!(resolved["first_tag"], Value::from("a"));
        assert_eq!(resolved["limit"], Value::Int(10));
        assert_eq!(resolved["price"], Value::from("$5"));
        assert_eq!(resolved["literal"], Value::Int(42));
        assert_eq!(
            resolved["nested"].get_path("list.0"),
            Some(&Value::from("b"))
        );
        assert_eq!(resolved["nested"].get_path("inner"), Some(&Value::Int(10)));
    }

    #[test]
    fn test_resolve_input_unknown_reference_is_fatal() {
        let mapping = vars(serde_json::json!({"x": "$missing.path"}));
        let err = resolve_input(&mapping, &ValueMap::new()).unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("missing.path"));
    }

    #[tokio::test]
    async fn test_missing_callback_is_fatal() {
        let executor = StepExecutor::new(StepRegistry::new(), Duration::from_secs(1));
        let result = executor.run_attempt(&invocation(StepKind::Condition, None)).await;
        match result {
            AttemptResult::Failed(f) => {
                assert!(!f.retryable);
                assert!(f.message.contains("condition"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_retryable_failure() {
        let mut registry = StepRegistry::new();
        registry.register(StepKind::Task, Hang);
        let executor = StepExecutor::new(registry, Duration::from_secs(300));

        let result = executor.run_attempt(&invocation(StepKind::Task, Some(1))).await;
        match result {
            AttemptResult::Failed(f) => {
                assert!(f.retryable);
                assert!(f.message.contains("timed out after 1000ms"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_aborts_attempt() {
        let mut registry = StepRegistry::new();
        registry.register(StepKind::Task, Hang);
        let executor = StepExecutor::new(registry, Duration::from_secs(300));

        let inv = invocation(StepKind::Task, None);
        let cancel = inv.cancel.clone();
        let handle = tokio::spawn(async move { executor.run_attempt(&inv).await });
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), AttemptResult::Cancelled);
    }

    #[tokio::test]
    async fn test_callback_failure_is_passed_through() {
        let mut registry = StepRegistry::new();
        registry.register(StepKind::Task, Flaky);
        let executor = StepExecutor::new(registry, Duration::from_secs(5));
        let result = executor.run_attempt(&invocation(StepKind::Task, None)).await;
        assert_eq!(
            result,
            AttemptResult::Failed(StepFailure::retryable("connection reset"))
        );
    }
}
