//! Timeline reconstruction from the snapshot log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rewind_types::snapshot::{ExecutionSnapshot, SnapshotType, TimelineEntry};

/// Build the timeline for one execution's snapshots.
///
/// Entries come out in creation order. Every `step_end` or `error` entry is
/// paired with the most recent still-open `step_start` of the same
/// `(step_index, step_id)` and carries the elapsed milliseconds.
pub fn build_timeline(snapshots: &[ExecutionSnapshot]) -> Vec<TimelineEntry> {
    let mut ordered: Vec<&ExecutionSnapshot> = snapshots.iter().collect();
    ordered.sort_by_key(|s| s.sequence);

    let mut open: HashMap<(u32, Option<&str>), Vec<DateTime<Utc>>> = HashMap::new();
    let mut entries = Vec::with_capacity(ordered.len());

    for snap in ordered {
        let key = (snap.step_index, snap.step_id());
        let duration = match snap.snapshot_type {
            SnapshotType::StepStart => {
                open.entry(key).or_default().push(snap.timestamp);
                None
            }
            SnapshotType::StepEnd | SnapshotType::Error => open
                .get_mut(&key)
                .and_then(Vec::pop)
                .map(|started| (snap.timestamp - started).num_milliseconds()),
            _ => None,
        };

        entries.push(TimelineEntry {
            snapshot_id: snap.id,
            sequence: snap.sequence,
            step_index: snap.step_index,
            step_id: snap.step_id().map(str::to_string),
            snapshot_type: snap.snapshot_type,
            timestamp: snap.timestamp,
            duration_since_step_start_ms: duration,
        });
    }

    entries
}
