//! Workflow definition parsing, validation, and file loading.
//!
//! Converts between YAML files and the canonical `WorkflowDefinition`,
//! and validates structural constraints (name format, unique step IDs,
//! known dependencies, acyclic graph).

use std::collections::HashSet;
use std::path::Path;

use rewind_types::workflow::WorkflowDefinition;
use thiserror::Error;

use super::dag::validate_dag;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load and validate a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, hyphens, underscores
/// - At least one step exists
/// - Step IDs are non-empty and unique
/// - All `depends_on` references point to existing step IDs
/// - The dependency graph is acyclic
/// - Step timeouts are > 0 if set
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name '{}' contains invalid characters (only alphanumerics, hyphens and underscores allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() {
            return Err(WorkflowError::ValidationError(
                "step ID must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        if step.timeout_secs == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }
    }

    validate_dag(&def.steps)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_types::workflow::StepKind;

    const VALID: &str = r#"
name: order_sync
status: active
steps:
  - id: fetch
  - id: transform
    depends_on: [fetch]
    checkpoint: true
  - id: save
    depends_on: [transform]
"#;

    #[test]
    fn test_parse_valid_workflow() {
        let def = parse_workflow_yaml(VALID).unwrap();
        assert_eq!(def.name, "order_sync");
        assert_eq!(def.steps.len(), 3);
        assert!(def.steps.iter().all(|s| s.kind == StepKind::Task));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let def = parse_workflow_yaml(VALID).unwrap();
        let yaml = serialize_workflow_yaml(&def).unwrap();
        let back = parse_workflow_yaml(&yaml).unwrap();
        assert_eq!(back.id, def.id);
        assert_eq!(back.steps[1].depends_on, vec!["fetch".to_string()]);
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = parse_workflow_yaml("name: [unterminated").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let err = parse_workflow_yaml("name: 'has space'\nsteps:\n  - id: a\n").unwrap_err();
        assert!(matches!(err, WorkflowError::ValidationError(_)));
        assert!(err.to_string().contains("invalid characters"));
    }

    #[test]
    fn test_empty_steps_rejected() {
        let err = parse_workflow_yaml("name: empty\nsteps: []\n").unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let err = parse_workflow_yaml("name: dup\nsteps:\n  - id: a\n  - id: a\n").unwrap_err();
        assert!(err.to_string().contains("duplicate step ID"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let yaml = "name: dangling\nsteps:\n  - id: a\n    depends_on: [ghost]\n";
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency(_)));
    }

    #[test]
    fn test_cycle_rejected() {
        let yaml = r#"
name: loop
steps:
  - id: a
    depends_on: [b]
  - id: b
    depends_on: [a]
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let yaml = "name: t\nsteps:\n  - id: a\n    timeout_secs: 0\n";
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order_sync.yaml");
        std::fs::write(&path, VALID).unwrap();
        let def = load_workflow_file(&path).unwrap();
        assert_eq!(def.name, "order_sync");

        let missing = load_workflow_file(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(missing, WorkflowError::IoError(_)));
    }
}
