//! CLI workflow definition subcommands: register, list, show.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use rewind_core::repository::workflow::WorkflowDefinitionStore;
use rewind_core::workflow::definition::{load_workflow_file, serialize_workflow_yaml, WorkflowError};
use rewind_types::workflow::{WorkflowDefinition, WorkflowStatus};

use crate::state::AppState;

/// Workflow definition subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Register (or update) a workflow from a YAML file.
    Register {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Mark the workflow active so it can be run.
        #[arg(long)]
        activate: bool,
    },

    /// List registered workflows.
    List,

    /// Print a registered workflow as YAML.
    Show {
        /// Workflow name or UUID.
        name: String,
    },
}

pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Register { file, activate } => {
            handle_register(&file, activate, state, json).await
        }
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Show { name } => handle_show(&name, state, json).await,
    }
}

/// Look up a workflow by UUID first, then by name.
pub async fn resolve_workflow(state: &AppState, target: &str) -> Result<WorkflowDefinition> {
    if let Ok(id) = target.parse::<uuid::Uuid>() {
        if let Some(def) = state
            .workflows
            .get_definition(&id)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to look up workflow: {e}"))?
        {
            return Ok(def);
        }
    }

    state
        .workflows
        .get_definition_by_name(target)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to look up workflow: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Workflow '{target}' not found"))
}

/// Parse, validate, and save a workflow file. Re-registering a name keeps
/// its id so existing executions stay attached.
pub async fn register_workflow(
    state: &AppState,
    file: &Path,
    activate: bool,
) -> Result<WorkflowDefinition> {
    let mut def = load_workflow_file(file).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow::anyhow!("Failed to parse workflow YAML: {msg}"),
        WorkflowError::IoError(err) => {
            anyhow::anyhow!("Failed to read {}: {err}", file.display())
        }
        other => anyhow::anyhow!("Workflow validation failed: {other}"),
    })?;

    if let Some(existing) = state
        .workflows
        .get_definition_by_name(&def.name)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to look up workflow: {e}"))?
    {
        tracing::debug!(workflow_id = %existing.id, name = def.name.as_str(), "updating existing workflow");
        def.id = existing.id;
    }
    if activate {
        def.status = WorkflowStatus::Active;
    }

    state
        .workflows
        .save_definition(&def)
        .await
        .with_context(|| format!("Failed to save workflow '{}'", def.name))?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Register
// ---------------------------------------------------------------------------

async fn handle_register(file: &Path, activate: bool, state: &AppState, json: bool) -> Result<()> {
    let def = register_workflow(state, file, activate).await?;

    if json {
        let out = serde_json::json!({
            "id": def.id.to_string(),
            "name": def.name,
            "status": def.status.to_string(),
            "steps": def.steps.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Registered workflow '{}'",
        style("*").green().bold(),
        style(&def.name).cyan()
    );
    println!("  ID: {}", def.id);
    println!("  Status: {}", def.status);
    println!("  Steps: {}", def.steps.len());
    if def.status != WorkflowStatus::Active {
        println!();
        println!(
            "  Activate it with: {}",
            style(format!("rewind workflow register {} --activate", file.display())).dim()
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let defs = state
        .workflows
        .list_definitions()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list workflows: {e}"))?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id.to_string(),
                    "name": d.name,
                    "status": d.status.to_string(),
                    "steps": d.steps.len(),
                    "checkpoints": d.steps.iter().filter(|s| s.checkpoint).count(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows registered.");
        println!(
            "  Register one with: {}",
            style("rewind workflow register <file.yaml> --activate").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Steps"),
            Cell::new("Checkpoints"),
            Cell::new("ID"),
        ]);

    for d in &defs {
        let status = match d.status {
            WorkflowStatus::Active => Cell::new("active").fg(Color::Green),
            WorkflowStatus::Draft => Cell::new("draft").fg(Color::Yellow),
            WorkflowStatus::Archived => Cell::new("archived").fg(Color::DarkGrey),
        };
        table.add_row(vec![
            Cell::new(&d.name),
            status,
            Cell::new(d.steps.len()),
            Cell::new(d.steps.iter().filter(|s| s.checkpoint).count()),
            Cell::new(d.id),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(target: &str, state: &AppState, json: bool) -> Result<()> {
    let def = resolve_workflow(state, target).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&def)?);
        return Ok(());
    }

    let yaml = serialize_workflow_yaml(&def)
        .map_err(|e| anyhow::anyhow!("Failed to render workflow: {e}"))?;
    print!("{yaml}");
    Ok(())
}
