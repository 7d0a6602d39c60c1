//! Event infrastructure for execution lifecycle notifications.

pub mod bus;
