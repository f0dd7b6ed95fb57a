//! Task ingestion from per-file JSON definitions.
//!
//! Every `*.json` under `tasks/` is one task definition. The loader
//! materializes each as a pending `Task` and records the source filename.
//! A missing `id` is fatal; so is a duplicate. Re-loading refreshes the
//! definition fields of existing tasks and removes tasks whose files have
//! disappeared; the engine-owned mutable subset (status, timing, files,
//! verification) survives a re-load.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::errors::{CoreResult, TaskError};
use crate::state::document::Task;
use crate::state::store::{is_valid_task_id, StateStore};

/// Raw task-file shape. Additional fields are tolerated and left on disk.
#[derive(Debug, Deserialize)]
struct RawTaskFile {
    id: Option<String>,
    name: Option<String>,
    phase: Option<u32>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    blocks: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    description: Option<String>,
}

/// A parsed task definition, not yet merged into state.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub phase: u32,
    pub depends_on: BTreeSet<String>,
    pub blocks: BTreeSet<String>,
    /// Source filename under `tasks/`
    pub file: String,
}

impl TaskDefinition {
    /// Materialize as a pending task.
    pub fn into_task(self) -> Task {
        Task::new(
            &self.id,
            &self.name,
            self.phase,
            self.depends_on,
            self.blocks,
            &self.file,
        )
    }
}

/// Summary of a `load-tasks` pass.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub added: Vec<String>,
    pub refreshed: Vec<String>,
    pub removed: Vec<String>,
    pub total: usize,
}

/// Read and parse every task file under `<dir>/tasks/`, sorted by filename.
///
/// Fails on the first missing `id`, malformed `id`, unparseable file, or
/// duplicate ID across files.
pub fn read_task_definitions(dir: &Path) -> Result<Vec<TaskDefinition>, TaskError> {
    let tasks_dir = dir.join("tasks");
    if !tasks_dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<_> = fs::read_dir(&tasks_dir)
        .map_err(|e| TaskError::ParseFailed {
            file: tasks_dir.display().to_string(),
            detail: e.to_string(),
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    files.sort();

    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    let mut definitions = Vec::new();

    for path in files {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        let content = fs::read_to_string(&path).map_err(|e| TaskError::ParseFailed {
            file: filename.clone(),
            detail: e.to_string(),
        })?;
        let raw: RawTaskFile =
            serde_json::from_str(&content).map_err(|e| TaskError::ParseFailed {
                file: filename.clone(),
                detail: e.to_string(),
            })?;

        let id = raw.id.ok_or_else(|| TaskError::MissingId {
            file: filename.clone(),
        })?;
        if !is_valid_task_id(&id) {
            return Err(TaskError::MalformedId(id));
        }
        if let Some(first) = seen.get(&id) {
            return Err(TaskError::DuplicateId {
                id,
                first: first.clone(),
                second: filename,
            });
        }
        seen.insert(id.clone(), filename.clone());

        definitions.push(TaskDefinition {
            name: raw.name.unwrap_or_else(|| id.clone()),
            phase: raw.phase.unwrap_or(0),
            depends_on: raw.depends_on.into_iter().collect(),
            blocks: raw.blocks.into_iter().collect(),
            id,
            file: filename,
        });
    }

    Ok(definitions)
}

/// Load task definitions into state as a single transaction.
///
/// New IDs are inserted as pending tasks; existing IDs get their definition
/// fields refreshed; IDs with no remaining file are removed.
pub fn load_tasks(store: &StateStore) -> CoreResult<LoadReport> {
    let definitions = read_task_definitions(store.dir())?;

    store.update(|doc| {
        let mut report = LoadReport::default();
        let incoming: BTreeSet<String> = definitions.iter().map(|d| d.id.clone()).collect();

        let stale: Vec<String> = doc
            .tasks
            .keys()
            .filter(|id| !incoming.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            doc.tasks.remove(&id);
            report.removed.push(id);
        }

        for def in definitions {
            match doc.tasks.get_mut(&def.id) {
                Some(existing) => {
                    existing.name = def.name.clone();
                    existing.phase = def.phase;
                    existing.depends_on = def.depends_on.clone();
                    existing.blocks = def.blocks.clone();
                    existing.file = def.file.clone();
                    report.refreshed.push(def.id.clone());
                }
                None => {
                    let id = def.id.clone();
                    doc.tasks.insert(id.clone(), def.into_task());
                    report.added.push(id);
                }
            }
        }

        report.total = doc.tasks.len();
        doc.recompute_counters();
        doc.append_event(
            "tasks_loaded",
            None,
            serde_json::json!({
                "added": report.added,
                "refreshed": report.refreshed,
                "removed": report.removed,
                "total": report.total,
            }),
        );
        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            total = report.total,
            "loaded tasks"
        );
        Ok(report)
    })
}
