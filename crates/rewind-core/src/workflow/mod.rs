//! Workflow engine core: definition parsing, planning, step execution, and
//! the execution lifecycle.
//!
//! - `definition` -- YAML parsing, validation, file loading
//! - `dag` -- DAG builder, cycle detection, flattened execution plan
//! - `retry` -- retry state machine with bounded backoff
//! - `registry` -- step callback traits and the kind -> callback registry
//! - `step_executor` -- single attempts with timeout and cancellation
//! - `engine` -- execution lifecycle orchestration

pub mod dag;
pub mod definition;
pub mod engine;
pub mod registry;
pub mod retry;
pub mod step_executor;
