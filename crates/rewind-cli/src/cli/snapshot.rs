//! Time-travel commands: snapshots, timeline, mark, diff, compare.

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use uuid::Uuid;

use rewind_core::snapshot::diff::render_diff;
use rewind_types::diff::{CompareOptions, DiffFormat};
use rewind_types::snapshot::{ExecutionSnapshot, NewSnapshot, SnapshotQuery, SnapshotType};

use super::short_id;
use crate::state::AppState;

fn type_cell(snapshot_type: SnapshotType) -> Cell {
    let cell = Cell::new(snapshot_type.as_str());
    match snapshot_type {
        SnapshotType::StepStart => cell.fg(Color::Blue),
        SnapshotType::StepEnd => cell.fg(Color::Green),
        SnapshotType::Checkpoint => cell.fg(Color::Cyan),
        SnapshotType::Error => cell.fg(Color::Red),
        SnapshotType::Rollback => cell.fg(Color::DarkYellow),
        SnapshotType::Manual => cell.fg(Color::Magenta),
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

pub async fn handle_snapshots(
    state: &AppState,
    execution_id: Uuid,
    query: SnapshotQuery,
    json: bool,
) -> Result<()> {
    let snapshots = state
        .time_travel()
        .get_execution_snapshots(execution_id, &query)
        .await
        .context("Failed to list snapshots")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!();
        println!("  No snapshots match.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Seq"),
            Cell::new("Type"),
            Cell::new("Checkpoint"),
            Cell::new("Step ID"),
            Cell::new("Snapshot ID"),
            Cell::new("Time"),
            Cell::new("Description"),
        ]);

    for s in &snapshots {
        table.add_row(vec![
            Cell::new(s.step_index),
            Cell::new(s.sequence),
            type_cell(s.snapshot_type),
            Cell::new(if s.is_checkpoint { "yes" } else { "" }),
            Cell::new(s.step_id().unwrap_or("-")),
            Cell::new(s.id),
            Cell::new(s.timestamp.format("%H:%M:%S%.3f").to_string()),
            Cell::new(s.description.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!(
        "  Snapshots for execution {}",
        style(short_id(&execution_id)).cyan()
    );
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

pub async fn handle_timeline(state: &AppState, execution_id: Uuid, json: bool) -> Result<()> {
    let timeline = state
        .time_travel()
        .get_execution_timeline(execution_id)
        .await
        .context("Failed to build timeline")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&timeline)?);
        return Ok(());
    }

    if timeline.is_empty() {
        println!();
        println!("  Execution has not recorded any steps yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Seq").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Step ID"),
            Cell::new("Event"),
            Cell::new("Time"),
            Cell::new("Duration"),
        ]);

    for entry in &timeline {
        let duration = entry
            .duration_since_step_start_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(entry.sequence),
            Cell::new(entry.step_index),
            Cell::new(entry.step_id.as_deref().unwrap_or("-")),
            type_cell(entry.snapshot_type),
            Cell::new(entry.timestamp.format("%H:%M:%S%.3f").to_string()),
            Cell::new(duration),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Mark
// ---------------------------------------------------------------------------

/// Record the execution's current variables as a manual snapshot.
pub async fn mark_snapshot(
    state: &AppState,
    execution_id: Uuid,
    step_index: u32,
    checkpoint: bool,
    description: Option<String>,
) -> Result<ExecutionSnapshot> {
    let execution = state
        .engine
        .get_execution(execution_id)
        .await
        .context("Failed to load execution")?;

    let mut snapshot = NewSnapshot::new(
        execution_id,
        step_index,
        SnapshotType::Manual,
        execution.variables,
    )
    .with_meta("source", "cli")
    .checkpoint(checkpoint);
    if let Some(description) = description {
        snapshot = snapshot.with_description(description);
    }

    state
        .engine
        .create_snapshot(snapshot)
        .await
        .context("Failed to record snapshot")
}

pub async fn handle_mark(
    state: &AppState,
    execution_id: Uuid,
    step_index: u32,
    checkpoint: bool,
    description: Option<String>,
    json: bool,
) -> Result<()> {
    let snapshot = mark_snapshot(state, execution_id, step_index, checkpoint, description).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let kind = if snapshot.is_checkpoint {
        "checkpoint"
    } else {
        "snapshot"
    };
    println!();
    println!(
        "  {} Recorded {kind} at step {} (sequence {})",
        style("*").green().bold(),
        snapshot.step_index,
        snapshot.sequence
    );
    println!("  ID: {}", snapshot.id);
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Diff / compare
// ---------------------------------------------------------------------------

pub async fn handle_diff(
    state: &AppState,
    snapshot_ids: &[Uuid],
    format: DiffFormat,
    include_metadata: bool,
    json: bool,
) -> Result<()> {
    let options = CompareOptions {
        include_state_diff: true,
        include_metadata_diff: include_metadata,
        format,
    };
    let diffs = state
        .time_travel()
        .compare_snapshot_ids(snapshot_ids, &options)
        .await
        .context("Failed to diff snapshots")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&diffs)?);
        return Ok(());
    }

    for diff in &diffs {
        match format {
            DiffFormat::Summary => println!(
                "{} -> {}: {}",
                short_id(&diff.snapshot_a),
                short_id(&diff.snapshot_b),
                render_diff(diff, format)
            ),
            DiffFormat::Text | DiffFormat::Json => println!("{}", render_diff(diff, format)),
        }
    }
    Ok(())
}

pub async fn handle_compare(state: &AppState, a: Uuid, b: Uuid, json: bool) -> Result<()> {
    let comparison = state
        .time_travel()
        .compare_executions(a, b)
        .await
        .context("Failed to compare executions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&comparison)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new(format!("A {}", short_id(&a))),
            Cell::new(format!("B {}", short_id(&b))),
            Cell::new("Result"),
        ]);

    let id_cell = |id: Option<Uuid>| {
        Cell::new(id.map(|id| short_id(&id)).unwrap_or_else(|| "-".to_string()))
    };
    for step in &comparison.steps {
        let result = match &step.diff {
            _ if !step.differs => Cell::new("same").fg(Color::Green),
            Some(diff) => Cell::new(render_diff(diff, DiffFormat::Summary)).fg(Color::Yellow),
            None => Cell::new("missing on one side").fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(step.step_index),
            id_cell(step.snapshot_a),
            id_cell(step.snapshot_b),
            result,
        ]);
    }

    let summary = &comparison.summary;
    println!();
    println!("{table}");
    println!();
    println!(
        "  Compared {} steps, {} differ",
        summary.steps_compared, summary.steps_differing
    );
    match summary.first_divergence_index {
        Some(index) => println!("  First divergence at step {}", style(index).yellow().bold()),
        None => println!("  {}", style("Executions are identical").green()),
    }
    println!();
    Ok(())
}
