//! Shared domain types for Rewind.
//!
//! This crate contains the plain-data types exchanged across the engine:
//! workflow definitions, executions, the append-only snapshot log, diff and
//! timeline results, lifecycle events, configuration, and the error type
//! used by repository ports.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod diff;
pub mod error;
pub mod event;
pub mod execution;
pub mod snapshot;
pub mod value;
pub mod workflow;
