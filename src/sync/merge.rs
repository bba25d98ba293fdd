//! Conflict policy between cached copies and remote documents.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::remote::{assign_field, lookup_field, merge_into, DocumentData};

/// Field that carries the writer's version marker inside every profile document.
pub const VERSION_FIELD: &str = "syncVersion";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushDecision {
    Apply,
    /// The push predates a local write that has not been echoed back yet.
    Discard,
}

/// Decides whether a remote snapshot may replace the cached copy.
///
/// A push older than the last locally applied version is an echo of superseded state. Equal
/// versions go to the remote copy, which carries the server timestamp.
pub fn decide_push(local_version: u64, remote_version: u64) -> PushDecision {
    if remote_version < local_version {
        PushDecision::Discard
    } else {
        PushDecision::Apply
    }
}

pub fn version_of(data: &DocumentData) -> u64 {
    data.get(VERSION_FIELD).and_then(Value::as_u64).unwrap_or(0)
}

/// Overlays `remote` onto `local`: fields only known locally survive, every field the server has
/// wins.
pub fn overlay_remote(local: &DocumentData, remote: &DocumentData) -> DocumentData {
    let mut merged = local.clone();
    merge_into(&mut merged, remote);
    merged
}

/// Minimal merge patch turning `before` into `after`.
///
/// Nested objects are diffed key by key so that concurrent edits to disjoint fields of the same
/// map do not overwrite each other. Removed keys are written as `null`.
pub fn diff_patch(before: &DocumentData, after: &DocumentData) -> DocumentData {
    let mut patch = DocumentData::new();
    for (key, new_value) in after {
        match (before.get(key), new_value) {
            (Some(old), new) if old == new => {}
            (Some(Value::Object(old)), Value::Object(new)) => {
                let nested = diff_patch(old, new);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            _ => {
                patch.insert(key.clone(), new_value.clone());
            }
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    patch
}

/// Signed change of integer counter fields, keyed by dotted field path.
pub type FieldDeltas = BTreeMap<String, i64>;

fn field_i64(data: &DocumentData, field: &str) -> Option<i64> {
    lookup_field(data, field).and_then(Value::as_i64)
}

/// Expands `map.*` patterns to one dotted path per key present on either side.
fn expand_fields(before: &DocumentData, after: &DocumentData, fields: &[&str]) -> Vec<String> {
    let mut expanded = Vec::new();
    for field in fields {
        match field.strip_suffix(".*") {
            Some(parent) => {
                for side in [before, after] {
                    if let Some(Value::Object(map)) = lookup_field(side, parent) {
                        for key in map.keys() {
                            let path = format!("{parent}.{key}");
                            if !expanded.contains(&path) {
                                expanded.push(path);
                            }
                        }
                    }
                }
            }
            None => expanded.push(field.to_string()),
        }
    }
    expanded
}

/// How far each counter in `fields` moved between `before` and `after`. Unchanged counters are
/// left out.
pub fn counter_deltas(before: &DocumentData, after: &DocumentData, fields: &[&str]) -> FieldDeltas {
    let mut deltas = FieldDeltas::new();
    for field in expand_fields(before, after, fields) {
        let old = field_i64(before, &field).unwrap_or(0);
        let new = field_i64(after, &field).unwrap_or(0);
        if old != new {
            deltas.insert(field, new.saturating_sub(old));
        }
    }
    deltas
}

/// Rewrites a queued merge patch so it applies on top of `base` instead of the copy it was
/// diffed against.
///
/// Counters become `base + delta` (never below zero), high-water fields keep the larger of the
/// two values, and every other patched field is written as the player left it.
pub fn rebase_patch(
    patch: &DocumentData,
    deltas: &FieldDeltas,
    high_water: &[&str],
    base: &DocumentData,
) -> DocumentData {
    let mut rebased = patch.clone();
    for (field, delta) in deltas {
        let value = field_i64(base, field)
            .unwrap_or(0)
            .saturating_add(*delta)
            .max(0);
        assign_field(&mut rebased, field, Value::from(value));
    }
    for field in high_water {
        if let (Some(mine), Some(theirs)) = (field_i64(patch, field), field_i64(base, field)) {
            if theirs > mine {
                assign_field(&mut rebased, field, Value::from(theirs));
            }
        }
    }
    rebased
}
