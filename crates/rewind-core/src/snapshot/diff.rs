//! Snapshot diffing and diff rendering.

use std::fmt::Write as _;

use rewind_types::diff::{CompareOptions, DiffFormat, MapDiff, SnapshotDiff, ValueChange};
use rewind_types::snapshot::ExecutionSnapshot;
use rewind_types::value::ValueMap;

/// Key-level difference from `a` to `b`.
///
/// Keys only in `a` are `removed`, keys only in `b` are `added`, and shared
/// keys whose values are not deeply equal are `changed`. Output follows key
/// order.
pub fn diff_maps(a: &ValueMap, b: &ValueMap) -> MapDiff {
    let mut diff = MapDiff::default();
    for (key, before) in a {
        match b.get(key) {
            None => diff.removed.push((key.clone(), before.clone())),
            Some(after) if after != before => diff.changed.push(ValueChange {
                key: key.clone(),
                before: before.clone(),
                after: after.clone(),
            }),
            Some(_) => {}
        }
    }
    for (key, after) in b {
        if !a.contains_key(key) {
            diff.added.push((key.clone(), after.clone()));
        }
    }
    diff
}

/// Compare two snapshots. `options.format` is ignored here; it only affects
/// [`render_diff`].
pub fn diff_snapshots(
    a: &ExecutionSnapshot,
    b: &ExecutionSnapshot,
    options: &CompareOptions,
) -> SnapshotDiff {
    SnapshotDiff {
        snapshot_a: a.id,
        snapshot_b: b.id,
        state: options
            .include_state_diff
            .then(|| diff_maps(&a.state, &b.state)),
        metadata: options
            .include_metadata_diff
            .then(|| diff_maps(&a.metadata, &b.metadata)),
    }
}

/// Render a diff for display.
pub fn render_diff(diff: &SnapshotDiff, format: DiffFormat) -> String {
    match format {
        DiffFormat::Json => serde_json::to_string_pretty(diff)
            .unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}")),
        DiffFormat::Text => render_text(diff),
        DiffFormat::Summary => render_summary(diff),
    }
}

fn render_text(diff: &SnapshotDiff) -> String {
    let mut out = format!("--- {}\n+++ {}\n", diff.snapshot_a, diff.snapshot_b);
    for (section, map_diff) in [("state", &diff.state), ("metadata", &diff.metadata)] {
        let Some(map_diff) = map_diff else { continue };
        let _ = writeln!(out, "{section}:");
        if map_diff.is_empty() {
            out.push_str("  (no changes)\n");
            continue;
        }
        for (key, value) in &map_diff.removed {
            let _ = writeln!(out, "  - {key}: {value}");
        }
        for (key, value) in &map_diff.added {
            let _ = writeln!(out, "  + {key}: {value}");
        }
        for change in &map_diff.changed {
            let _ = writeln!(out, "  ~ {}: {} -> {}", change.key, change.before, change.after);
        }
    }
    out
}

fn render_summary(diff: &SnapshotDiff) -> String {
    if diff.is_empty() {
        return "no differences".to_string();
    }
    let describe = |name: &str, section: &Option<MapDiff>| match section {
        Some(d) => format!(
            "{name}: {} added, {} removed, {} changed",
            d.added.len(),
            d.removed.len(),
            d.changed.len()
        ),
        None => format!("{name}: not compared"),
    };
    format!(
        "{}; {}",
        describe("state", &diff.state),
        describe("metadata", &diff.metadata)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_types::snapshot::{NewSnapshot, SnapshotType};
    use rewind_types::value::Value;
    use uuid::Uuid;

    fn map(pairs: &[(&str, Value)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn snapshot(state: ValueMap) -> ExecutionSnapshot {
        NewSnapshot::new(Uuid::now_v7(), 0, SnapshotType::StepEnd, state).into_snapshot(0)
    }

    #[test]
    fn test_diff_classifies_keys() {
        let a = map(&[("kept", 1.into()), ("gone", "x".into()), ("moved", 1.into())]);
        let b = map(&[("kept", 1.into()), ("fresh", true.into()), ("moved", 2.into())]);
        let diff = diff_maps(&a, &b);

        assert_eq!(diff.removed, vec![("gone".to_string(), Value::from("x"))]);
        assert_eq!(diff.added, vec![("fresh".to_string(), Value::Bool(true))]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].key, "moved");
        assert_eq!(diff.changed[0].before, Value::Int(1));
        assert_eq!(diff.changed[0].after, Value::Int(2));
    }

    #[test]
    fn test_nested_change_is_detected() {
        let a = map(&[("order", Value::from(serde_json::json!({"items": [1, 2]})))]);
        let b = map(&[("order", Value::from(serde_json::json!({"items": [1, 3]})))]);
        assert_eq!(diff_maps(&a, &b).changed.len(), 1);
    }

    #[test]
    fn test_diff_is_reflexive() {
        let s = snapshot(map(&[
            ("nan", Value::Float(f64::NAN)),
            ("list", Value::from(vec![Value::Null, 1.into()])),
        ]));
        let opts = CompareOptions {
            include_metadata_diff: true,
            ..CompareOptions::default()
        };
        assert!(diff_snapshots(&s, &s, &opts).is_empty());
    }

    #[test]
    fn test_swapped_diff_is_inverted() {
        let a = map(&[("x", 1.into()), ("only_a", 0.into())]);
        let b = map(&[("x", 2.into())]);
        assert_eq!(diff_maps(&b, &a), diff_maps(&a, &b).inverted());
    }

    #[test]
    fn test_options_select_sections() {
        let a = snapshot(map(&[("x", 1.into())]));
        let b = snapshot(map(&[("x", 2.into())]));
        let diff = diff_snapshots(&a, &b, &CompareOptions::default());
        assert!(diff.state.is_some());
        assert!(diff.metadata.is_none());

        let no_state = CompareOptions {
            include_state_diff: false,
            ..CompareOptions::default()
        };
        assert!(diff_snapshots(&a, &b, &no_state).is_empty());
    }

    #[test]
    fn test_format_does_not_change_computation() {
        let a = snapshot(map(&[("x", 1.into())]));
        let b = snapshot(map(&[("x", 2.into()), ("y", 3.into())]));
        let json_opts = CompareOptions::default();
        let text_opts = CompareOptions {
            format: DiffFormat::Text,
            ..CompareOptions::default()
        };
        assert_eq!(
            diff_snapshots(&a, &b, &json_opts),
            diff_snapshots(&a, &b, &text_opts)
        );
    }

    #[test]
    fn test_render_formats() {
        let a = snapshot(map(&[("x", 1.into()), ("old", "o".into())]));
        let b = snapshot(map(&[("x", 2.into()), ("new", "n".into())]));
        let diff = diff_snapshots(&a, &b, &CompareOptions::default());

        let text = render_diff(&diff, DiffFormat::Text);
        assert!(text.contains("  - old: \"o\""));
        assert!(text.contains("  + new: \"n\""));
        assert!(text.contains("  ~ x: 1 -> 2"));

        let summary = render_diff(&diff, DiffFormat::Summary);
        assert_eq!(
            summary,
            "state: 1 added, 1 removed, 1 changed; metadata: not compared"
        );

        let json: serde_json::Value =
            serde_json::from_str(&render_diff(&diff, DiffFormat::Json)).unwrap();
        assert_eq!(json["state"]["changed"][0]["key"], "x");

        let same = diff_snapshots(&a, &a, &CompareOptions::default());
        assert_eq!(render_diff(&same, DiffFormat::Summary), "no differences");
    }
}
