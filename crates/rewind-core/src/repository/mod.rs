//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (rewind-infra) implements. The core crate never depends on any specific
//! storage technology; `memory` provides in-process implementations.

pub mod execution;
pub mod memory;
pub mod snapshot;
pub mod workflow;
