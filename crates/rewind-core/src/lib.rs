//! Execution engine and time-travel layer for Rewind.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus everything that runs on top of them: DAG planning,
//! the step executor, the execution engine, the snapshot store, and the
//! read-only time-travel service. It depends only on `rewind-types` -- never
//! on `rewind-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod snapshot;
pub mod workflow;
