//! Infrastructure layer for Rewind.
//!
//! Contains the SQLite implementations of the repository traits defined in
//! `rewind-core`, plus config file loading and data directory resolution.

pub mod config;
pub mod sqlite;
