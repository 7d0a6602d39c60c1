//! Observability setup for Rewind: structured logging with an optional
//! OpenTelemetry bridge.

pub mod tracing_setup;
