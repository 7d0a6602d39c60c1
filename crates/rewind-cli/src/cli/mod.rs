//! CLI command definitions for the `rewind` binary.
//!
//! Uses clap derive macros for argument parsing. Workflow definitions live
//! under `rewind workflow ...`; execution and time-travel commands are
//! top-level verbs (`rewind run`, `rewind rollback`, `rewind diff`).

pub mod execution;
pub mod snapshot;
pub mod workflow;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color};
use rewind_types::execution::ExecutionStatus;
use rewind_types::value::Value;
use uuid::Uuid;

/// Run workflows and travel back through their history.
#[derive(Parser)]
#[command(name = "rewind", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs to stderr as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true, env = "REWIND_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions (register, list, show).
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Start a new execution and step it until it finishes or pauses.
    Run {
        /// Workflow name or UUID.
        workflow: String,

        /// Initial variable as key=value; the value is parsed as JSON when
        /// possible, else kept as a string. Repeatable.
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Who or what started the execution.
        #[arg(long, default_value = "cli")]
        triggered_by: String,

        /// Parent execution UUID.
        #[arg(long)]
        parent: Option<Uuid>,

        /// Maximum concurrent steps in a parallel wave.
        #[arg(long)]
        fan_out: Option<usize>,
    },

    /// List executions, newest first.
    #[command(alias = "ls")]
    List {
        /// Filter by workflow name or UUID.
        #[arg(long)]
        workflow: Option<String>,

        /// Filter by status (pending, running, paused, completed, failed, rolled_back).
        #[arg(long)]
        status: Option<ExecutionStatus>,

        /// Maximum number of executions to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show progress of an execution.
    Progress {
        /// Execution UUID.
        execution: Uuid,
    },

    /// Pause a running execution. Also recovers one left running by a killed process.
    Pause {
        /// Execution UUID.
        execution: Uuid,
    },

    /// Resume a paused or failed execution.
    Resume {
        /// Execution UUID.
        execution: Uuid,

        /// Restart from this step id, restoring the nearest checkpoint.
        #[arg(long)]
        from_step: Option<String>,
    },

    /// Roll an execution back to a checkpoint and continue from there.
    Rollback {
        /// Execution UUID.
        execution: Uuid,

        /// Step index of the checkpoint to roll back to.
        #[arg(required_unless_present = "snapshot", conflicts_with = "snapshot")]
        checkpoint_index: Option<u32>,

        /// Roll back to a specific checkpoint snapshot instead.
        #[arg(long)]
        snapshot: Option<Uuid>,
    },

    /// List snapshots of an execution by step index.
    Snapshots {
        /// Execution UUID.
        execution: Uuid,

        /// Lowest step index to include.
        #[arg(long)]
        from: Option<u32>,

        /// Highest step index to include.
        #[arg(long)]
        to: Option<u32>,

        /// Only show checkpoints.
        #[arg(long)]
        checkpoints: bool,
    },

    /// Show the step lifecycle of an execution in creation order.
    Timeline {
        /// Execution UUID.
        execution: Uuid,
    },

    /// Record a manual snapshot of the execution's current variables.
    Mark {
        /// Execution UUID.
        execution: Uuid,

        /// Step index to record the snapshot at.
        #[arg(long)]
        step: u32,

        /// Mark the snapshot as a rollback target.
        #[arg(long)]
        checkpoint: bool,

        /// Free-form description.
        #[arg(long)]
        description: Option<String>,
    },

    /// Diff consecutive snapshots.
    Diff {
        /// Two or more snapshot UUIDs.
        #[arg(num_args = 2.., required = true)]
        snapshots: Vec<Uuid>,

        /// Output format: json, text, or summary.
        #[arg(long, default_value = "text")]
        format: rewind_types::diff::DiffFormat,

        /// Include metadata in the diff.
        #[arg(long)]
        metadata: bool,
    },

    /// Compare two executions step by step.
    Compare {
        /// First execution UUID.
        a: Uuid,

        /// Second execution UUID.
        b: Uuid,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse `key=value`, reading the value as JSON and falling back to a plain
/// string when it is not valid JSON.
pub fn parse_var(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("invalid variable '{raw}', expected KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("invalid variable '{raw}', key is empty");
    }
    let value = serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::from(value));
    Ok((key.to_string(), value))
}

pub fn status_cell(status: ExecutionStatus) -> Cell {
    match status {
        ExecutionStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        ExecutionStatus::Running => Cell::new("running").fg(Color::Blue),
        ExecutionStatus::Paused => Cell::new("paused").fg(Color::Magenta),
        ExecutionStatus::Completed => Cell::new("completed").fg(Color::Green),
        ExecutionStatus::Failed => Cell::new("failed").fg(Color::Red),
        ExecutionStatus::RolledBack => Cell::new("rolled_back").fg(Color::DarkYellow),
    }
}

pub fn styled_status(status: ExecutionStatus) -> console::StyledObject<&'static str> {
    let s = console::style(status.as_str());
    match status {
        ExecutionStatus::Pending => s.yellow(),
        ExecutionStatus::Running => s.blue(),
        ExecutionStatus::Paused => s.magenta(),
        ExecutionStatus::Completed => s.green(),
        ExecutionStatus::Failed => s.red(),
        ExecutionStatus::RolledBack => s.yellow().dim(),
    }
}

/// First eight characters of a UUID for table display.
pub fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}
