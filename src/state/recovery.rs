//! Best-effort recovery of a corrupt `state.json`.
//!
//! Corruption never silently overwrites: the raw bytes are copied to
//! `state.json.corrupted.<timestamp>` first. Recovery then rebuilds a
//! valid document keeping every field that parses individually, drops the
//! rest into a `data_lost` report, recomputes the execution counters from
//! surviving tasks, merges task definitions from `tasks/` for any ID that
//! disappeared, and appends a `state_recovered` event before saving
//! through the normal path. Running it against a healthy state is a no-op
//! apart from the `updated_at` bump.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::errors::{CoreError, CoreResult, StateError};
use crate::state::document::{
    Artifacts, Event, HaltState, PhaseState, StateDocument, Task, STATE_VERSION,
};
use crate::state::store::{is_valid_task_id, StateStore};
use crate::tasks::loader;

/// Outcome of a recovery pass.
#[derive(Debug)]
pub struct RecoveryReport {
    /// Whether the state file had to be rebuilt
    pub rebuilt: bool,
    /// Where the corrupt bytes were backed up, if any
    pub backup_path: Option<PathBuf>,
    /// Fields and entries that could not be salvaged
    pub data_lost: Vec<String>,
    /// Task IDs re-merged from `tasks/` definitions
    pub merged_tasks: Vec<String>,
}

/// Attempt to parse `state.json`; rebuild it when parsing or validation fails.
pub fn recover(store: &StateStore) -> CoreResult<RecoveryReport> {
    match store.load() {
        Ok(mut doc) => {
            // Healthy state: save-through only bumps updated_at.
            store.save(&mut doc)?;
            Ok(RecoveryReport {
                rebuilt: false,
                backup_path: None,
                data_lost: Vec::new(),
                merged_tasks: Vec::new(),
            })
        }
        Err(CoreError::State(StateError::Corrupt { .. }))
        | Err(CoreError::State(StateError::Invalid { .. })) => rebuild(store),
        Err(other) => Err(other),
    }
}

fn rebuild(store: &StateStore) -> CoreResult<RecoveryReport> {
    let state_path = store.state_path();
    let raw = fs::read(&state_path).map_err(|source| CoreError::ReadFailed {
        path: state_path.clone(),
        source,
    })?;

    let backup_path = backup_corrupt_bytes(store, &raw)?;
    warn!(backup = %backup_path.display(), "state.json is corrupt, rebuilding");

    let parsed: Option<Value> = serde_json::from_slice(&raw).ok();
    let mut data_lost = Vec::new();
    let mut doc = salvage_document(store, parsed.as_ref(), &mut data_lost);

    let merged_tasks = merge_task_definitions(store, &mut doc, &mut data_lost);
    doc.recompute_counters();
    doc.append_event(
        "state_recovered",
        None,
        serde_json::json!({
            "backup": backup_path.display().to_string(),
            "data_lost": data_lost,
            "merged_tasks": merged_tasks,
        }),
    );

    store.save(&mut doc)?;
    info!(
        lost = data_lost.len(),
        merged = merged_tasks.len(),
        "state recovered"
    );
    Ok(RecoveryReport {
        rebuilt: true,
        backup_path: Some(backup_path),
        data_lost,
        merged_tasks,
    })
}

fn backup_corrupt_bytes(store: &StateStore, raw: &[u8]) -> CoreResult<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let backup = store.dir().join(format!("state.json.corrupted.{stamp}"));
    fs::write(&backup, raw).map_err(|source| CoreError::IoWriteFailed {
        path: backup.clone(),
        source,
    })?;
    Ok(backup)
}

/// Keep every field that parses individually and matches its type; record
/// the rest in `data_lost`.
fn salvage_document(
    store: &StateStore,
    value: Option<&Value>,
    data_lost: &mut Vec<String>,
) -> StateDocument {
    let fallback_target = store.dir().display().to_string();

    let Some(value) = value else {
        data_lost.push("document: unparseable JSON".to_string());
        return StateDocument::new(&fallback_target);
    };

    let target_dir = match value.get("target_dir").and_then(Value::as_str) {
        Some(dir) if !dir.trim().is_empty() => dir.to_string(),
        _ => {
            data_lost.push("target_dir".to_string());
            fallback_target
        }
    };
    let mut doc = StateDocument::new(&target_dir);

    if value.get("version").is_some_and(|v| v != STATE_VERSION) {
        data_lost.push("version".to_string());
    }
    salvage_field::<DateTime<Utc>>(value, "created_at", data_lost, |ts| doc.created_at = ts);
    salvage_field::<PhaseState>(value, "phase", data_lost, |phase| doc.phase = phase);
    salvage_field::<Artifacts>(value, "artifacts", data_lost, |artifacts| {
        doc.artifacts = artifacts;
    });
    salvage_field::<HaltState>(value, "halt", data_lost, |halt| doc.halt = Some(halt));

    // Token and cost totals are the only execution fields worth keeping;
    // the rest is recomputed from tasks.
    if let Some(exec) = value.get("execution") {
        if let Some(tokens) = exec.get("total_tokens").and_then(Value::as_u64) {
            doc.execution.total_tokens = tokens;
        }
        if let Some(cost) = exec.get("total_cost_usd").and_then(Value::as_f64) {
            doc.execution.total_cost_usd = cost;
        }
    }

    // Events are salvaged one by one.
    if let Some(events) = value.get("events").and_then(Value::as_array) {
        for (i, raw_event) in events.iter().enumerate() {
            match serde_json::from_value::<Event>(raw_event.clone()) {
                Ok(event) => doc.events.push(event),
                Err(_) => data_lost.push(format!("events[{i}]")),
            }
        }
    }

    // Tasks likewise: each entry stands or falls on its own.
    if let Some(tasks) = value.get("tasks").and_then(Value::as_object) {
        for (id, raw_task) in tasks {
            if !is_valid_task_id(id) {
                data_lost.push(format!("tasks.{id}: malformed id"));
                continue;
            }
            match serde_json::from_value::<Task>(raw_task.clone()) {
                Ok(task) if task.id == *id => {
                    doc.tasks.insert(id.clone(), task);
                }
                Ok(_) => data_lost.push(format!("tasks.{id}: id mismatch")),
                Err(_) => data_lost.push(format!("tasks.{id}")),
            }
        }
    }

    doc
}

/// Re-merge definitions from `tasks/` for any ID that disappeared.
fn merge_task_definitions(
    store: &StateStore,
    doc: &mut StateDocument,
    data_lost: &mut Vec<String>,
) -> Vec<String> {
    let mut merged = Vec::new();
    let definitions = match loader::read_task_definitions(store.dir()) {
        Ok(defs) => defs,
        Err(e) => {
            data_lost.push(format!("tasks/: {e}"));
            return merged;
        }
    };
    for def in definitions {
        if !doc.tasks.contains_key(&def.id) {
            let id = def.id.clone();
            doc.tasks.insert(id.clone(), def.into_task());
            merged.push(id);
        }
    }
    merged.sort();
    merged
}

/// Apply a field that is present and parses; a present-but-unparseable
/// field is recorded as lost, an absent one keeps the default silently.
fn salvage_field<T: DeserializeOwned>(
    value: &Value,
    field: &str,
    data_lost: &mut Vec<String>,
    apply: impl FnOnce(T),
) {
    match value.get(field) {
        None => {}
        Some(v) if v.is_null() => {}
        Some(v) => match serde_json::from_value::<T>(v.clone()) {
            Ok(parsed) => apply(parsed),
            Err(_) => data_lost.push(field.to_string()),
        },
    }
}
