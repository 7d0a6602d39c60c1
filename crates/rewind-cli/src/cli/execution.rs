//! Execution lifecycle commands: run, list, progress, pause, resume, rollback.
//!
//! The stepper runs inside this process, so every command that (re)starts
//! stepping follows the execution until it goes idle. Ctrl-C pauses it.

use std::collections::HashMap;

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use rewind_core::event::bus::ExecutionEvents;
use rewind_core::repository::workflow::WorkflowDefinitionStore;
use rewind_core::workflow::engine::StartOptions;
use rewind_types::error::ErrorKind;
use rewind_types::event::ExecutionEvent;
use rewind_types::execution::{Execution, ExecutionFilter, ExecutionStatus};
use rewind_types::value::ValueMap;

use super::workflow::resolve_workflow;
use super::{parse_var, short_id, status_cell, styled_status};
use crate::state::AppState;

/// How a follow loop should report.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    fn show_progress(self) -> bool {
        !self.json && !self.quiet
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    workflow: &str,
    raw_vars: &[String],
    triggered_by: &str,
    parent: Option<Uuid>,
    fan_out: Option<usize>,
    out: Output,
) -> Result<()> {
    let def = resolve_workflow(state, workflow).await?;

    let mut vars = ValueMap::new();
    for raw in raw_vars {
        let (key, value) = parse_var(raw)?;
        vars.insert(key, value);
    }

    let events = state.engine.subscribe();
    let options = StartOptions {
        parent_execution_id: parent,
        max_fan_out: fan_out,
    };
    let execution_id = state
        .engine
        .start_execution(def.id, triggered_by, vars, options)
        .await
        .with_context(|| format!("Failed to start workflow '{}'", def.name))?;

    if out.show_progress() {
        println!();
        println!(
            "  {} Started '{}' as {}",
            style("*").green().bold(),
            style(&def.name).cyan(),
            execution_id
        );
        println!();
    }

    let execution = follow_execution(state, execution_id, events, out).await?;
    display_execution(&execution, out)
}

/// Print step events until the execution goes idle; Ctrl-C pauses it.
pub async fn follow_execution(
    state: &AppState,
    execution_id: Uuid,
    receiver: broadcast::Receiver<ExecutionEvent>,
    out: Output,
) -> Result<Execution> {
    let mut events = ExecutionEvents::new(receiver, execution_id);
    let idle = state.engine.wait_for_idle(execution_id);
    tokio::pin!(idle);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut idle => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if out.show_progress() {
                        print_event(&event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged, some step events were not shown");
                }
                Err(RecvError::Closed) => {
                    (&mut idle).await;
                    break;
                }
            },
            signal = &mut ctrl_c => {
                signal.context("Failed to listen for Ctrl-C")?;
                pause_on_interrupt(state, execution_id, out).await?;
                break;
            }
        }
    }

    // Events published just before the stepper exited.
    while let Some(event) = events.try_next() {
        if out.show_progress() {
            print_event(&event);
        }
    }

    state
        .engine
        .get_execution(execution_id)
        .await
        .context("Failed to load execution")
}

async fn pause_on_interrupt(state: &AppState, execution_id: Uuid, out: Output) -> Result<()> {
    if out.show_progress() {
        println!();
        println!("  {} Interrupted, pausing execution...", style("!").yellow().bold());
    }
    match state.engine.pause_execution(execution_id).await {
        Ok(_) => Ok(()),
        // Finished before the pause landed.
        Err(e) if e.kind() == ErrorKind::InvalidState => Ok(()),
        Err(e) => Err(e).context("Failed to pause execution"),
    }
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::StepStarted {
            step_id,
            step_index,
            attempt,
            ..
        } => {
            let retry = if *attempt > 1 {
                format!(" (attempt {attempt})")
            } else {
                String::new()
            };
            println!("  {} [{step_index}] {step_id}{retry}", style(">").dim());
        }
        ExecutionEvent::StepCompleted {
            step_id,
            step_index,
            duration_ms,
            ..
        } => {
            println!(
                "  {} [{step_index}] {step_id} {}",
                style("✓").green(),
                style(format!("{duration_ms}ms")).dim()
            );
        }
        ExecutionEvent::StepFailed {
            step_id,
            step_index,
            error,
            will_retry,
            ..
        } => {
            let suffix = if *will_retry { " (retrying)" } else { "" };
            println!(
                "  {} [{step_index}] {step_id}: {}{suffix}",
                style("✗").red(),
                style(error).red()
            );
        }
        ExecutionEvent::ExecutionRolledBack {
            from_step_index,
            to_step_index,
            ..
        } => {
            println!(
                "  {} rolled back from step {from_step_index} to {to_step_index}",
                style("↺").yellow()
            );
        }
        ExecutionEvent::ExecutionResumed { step_index, .. } => {
            println!("  {} resumed at step {step_index}", style("▶").blue());
        }
        ExecutionEvent::ExecutionPaused { step_index, .. } => {
            println!("  {} paused at step {step_index}", style("‖").magenta());
        }
        ExecutionEvent::ExecutionStarted { .. }
        | ExecutionEvent::ExecutionCompleted { .. }
        | ExecutionEvent::ExecutionFailed { .. } => {}
    }
}

fn display_execution(execution: &Execution, out: Output) -> Result<()> {
    if out.json {
        println!("{}", serde_json::to_string_pretty(execution)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Execution").bold(),
        style(&execution.id).cyan()
    );
    println!("  Status: {}", styled_status(execution.status));
    println!(
        "  Progress: {}/{} ({:.0}%)",
        execution.current_step_index,
        execution.total_steps,
        execution.progress * 100.0
    );
    println!("  Triggered by: {}", execution.triggered_by);
    if let Some(parent) = execution.parent_execution_id {
        println!("  Parent: {parent}");
    }
    println!("  Started: {}", execution.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = execution.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref err) = execution.error {
        println!("  Error: {}", style(err).red());
    }
    if !execution.variables.is_empty() {
        println!("  Variables:");
        for (key, value) in &execution.variables {
            println!("    {key} = {value}");
        }
    }
    match execution.status {
        ExecutionStatus::Paused | ExecutionStatus::Failed => {
            println!();
            println!(
                "  Resume with: {}",
                style(format!("rewind resume {}", execution.id)).dim()
            );
        }
        _ => {}
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn handle_list(
    state: &AppState,
    workflow: Option<&str>,
    status: Option<ExecutionStatus>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let workflow_id = match workflow {
        Some(target) => Some(resolve_workflow(state, target).await?.id),
        None => None,
    };
    let filter = ExecutionFilter {
        workflow_id,
        status,
        limit,
    };
    let executions = state
        .engine
        .get_executions(&filter)
        .await
        .context("Failed to list executions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions found.");
        println!();
        return Ok(());
    }

    let names: HashMap<Uuid, String> = state
        .workflows
        .list_definitions()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list workflows: {e}"))?
        .into_iter()
        .map(|d| (d.id, d.name))
        .collect();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Started"),
            Cell::new("Error"),
        ]);

    for e in &executions {
        let workflow_name = names
            .get(&e.workflow_id)
            .cloned()
            .unwrap_or_else(|| short_id(&e.workflow_id));
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(workflow_name),
            status_cell(e.status),
            Cell::new(format!("{}/{}", e.current_step_index, e.total_steps)),
            Cell::new(e.started_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(e.error.as_deref().unwrap_or("-")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Progress / pause
// ---------------------------------------------------------------------------

pub async fn handle_progress(state: &AppState, execution_id: Uuid, json: bool) -> Result<()> {
    let progress = state
        .engine
        .get_progress(execution_id)
        .await
        .context("Failed to get progress")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }

    const WIDTH: usize = 30;
    let filled = ((progress.percent / 100.0) * WIDTH as f64).round() as usize;
    let bar = format!(
        "{}{}",
        "█".repeat(filled.min(WIDTH)),
        "░".repeat(WIDTH - filled.min(WIDTH))
    );

    println!();
    println!(
        "  {} {:>5.1}%  {}",
        style(bar).cyan(),
        progress.percent,
        styled_status(progress.status)
    );
    println!(
        "  Step {} of {}",
        progress.current_step_index, progress.total_steps
    );
    println!();
    Ok(())
}

pub async fn handle_pause(state: &AppState, execution_id: Uuid, out: Output) -> Result<()> {
    let execution = state
        .engine
        .pause_execution(execution_id)
        .await
        .context("Failed to pause execution")?;
    display_execution(&execution, out)
}

// ---------------------------------------------------------------------------
// Resume / rollback
// ---------------------------------------------------------------------------

pub async fn handle_resume(
    state: &AppState,
    execution_id: Uuid,
    from_step: Option<&str>,
    out: Output,
) -> Result<()> {
    let events = state.engine.subscribe();
    state
        .engine
        .resume_execution(execution_id, from_step)
        .await
        .context("Failed to resume execution")?;

    let execution = follow_execution(state, execution_id, events, out).await?;
    display_execution(&execution, out)
}

pub async fn handle_rollback(
    state: &AppState,
    execution_id: Uuid,
    checkpoint_index: Option<u32>,
    snapshot_id: Option<Uuid>,
    out: Output,
) -> Result<()> {
    let events = state.engine.subscribe();
    match (checkpoint_index, snapshot_id) {
        (_, Some(snapshot_id)) => state
            .engine
            .rollback_to_snapshot(execution_id, snapshot_id)
            .await
            .context("Failed to roll back execution")?,
        (Some(index), None) => state
            .engine
            .rollback_to_checkpoint(execution_id, index)
            .await
            .context("Failed to roll back execution")?,
        (None, None) => anyhow::bail!("a checkpoint index or --snapshot is required"),
    };

    let execution = follow_execution(state, execution_id, events, out).await?;
    display_execution(&execution, out)
}
