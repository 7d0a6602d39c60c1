//! Rewind CLI entry point.
//!
//! Binary name: `rewind`
//!
//! Parses CLI arguments, initializes tracing, the database, and the engine,
//! then dispatches to the matching command handler.

mod cli;
mod state;
mod steps;

use clap::Parser;
use rewind_observe::tracing_setup::{init_tracing, shutdown_tracing, TracingOptions};
use rewind_types::snapshot::SnapshotQuery;

use cli::execution::Output;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingOptions {
        verbosity: cli.verbose,
        json: cli.log_json,
        enable_otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;
    let json = cli.json;
    let out = Output {
        json,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, json).await?;
        }

        Commands::Run {
            workflow,
            vars,
            triggered_by,
            parent,
            fan_out,
        } => {
            cli::execution::handle_run(
                &state,
                &workflow,
                &vars,
                &triggered_by,
                parent,
                fan_out,
                out,
            )
            .await?;
        }

        Commands::List {
            workflow,
            status,
            limit,
        } => {
            cli::execution::handle_list(&state, workflow.as_deref(), status, limit, json).await?;
        }

        Commands::Progress { execution } => {
            cli::execution::handle_progress(&state, execution, json).await?;
        }

        Commands::Pause { execution } => {
            cli::execution::handle_pause(&state, execution, out).await?;
        }

        Commands::Resume {
            execution,
            from_step,
        } => {
            cli::execution::handle_resume(&state, execution, from_step.as_deref(), out).await?;
        }

        Commands::Rollback {
            execution,
            checkpoint_index,
            snapshot,
        } => {
            cli::execution::handle_rollback(&state, execution, checkpoint_index, snapshot, out)
                .await?;
        }

        Commands::Snapshots {
            execution,
            from,
            to,
            checkpoints,
        } => {
            let query = SnapshotQuery {
                from_step: from,
                to_step: to,
                checkpoints_only: checkpoints,
            };
            cli::snapshot::handle_snapshots(&state, execution, query, json).await?;
        }

        Commands::Timeline { execution } => {
            cli::snapshot::handle_timeline(&state, execution, json).await?;
        }

        Commands::Mark {
            execution,
            step,
            checkpoint,
            description,
        } => {
            cli::snapshot::handle_mark(&state, execution, step, checkpoint, description, json)
                .await?;
        }

        Commands::Diff {
            snapshots,
            format,
            metadata,
        } => {
            cli::snapshot::handle_diff(&state, &snapshots, format, metadata, json).await?;
        }

        Commands::Compare { a, b } => {
            cli::snapshot::handle_compare(&state, a, b, json).await?;
        }
    }

    Ok(())
}
