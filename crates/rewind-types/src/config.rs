//! Rewind configuration, loaded from `{data_dir}/config.toml`.

use serde::{Deserialize, Serialize};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewindConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Execution engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of steps of one wave run concurrently.
    #[serde(default = "default_max_fan_out")]
    pub max_fan_out: usize,
    /// Bound on acquiring the per-execution lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Bound on waiting for a cancelled stepper to stop.
    #[serde(default = "default_stepper_stop_timeout_ms")]
    pub stepper_stop_timeout_ms: u64,
    /// Per-attempt timeout for steps that don't set their own.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_fan_out() -> usize {
    4
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_stepper_stop_timeout_ms() -> u64 {
    30_000
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fan_out: default_max_fan_out(),
            lock_timeout_ms: default_lock_timeout_ms(),
            stepper_stop_timeout_ms: default_stepper_stop_timeout_ms(),
            default_step_timeout_secs: default_step_timeout_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL. Defaults to `sqlite://{data_dir}/rewind.db`.
    #[serde(default)]
    pub url: Option<String>,
}
