//! The append-only snapshot log and the time-travel layer on top of it.
//!
//! - `locks` -- per-execution lock arena guarding the snapshot cursor
//! - `store` -- sequenced appends and range queries
//! - `diff` -- snapshot diffing and rendering
//! - `timeline` -- step lifecycle reconstruction
//! - `time_travel` -- read-only query service

pub mod diff;
pub mod locks;
pub mod store;
pub mod time_travel;
pub mod timeline;
