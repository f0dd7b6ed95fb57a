//! Batch checkpoint coordinator.
//!
//! A checkpoint survives the window between spawning a batch of workers
//! and collecting their outcomes. The sidecar `orchestrator-checkpoint.json`
//! holds the current batch; its absence means no batch is in flight.
//! Writes are atomic (temp file + rename). Crash recovery reconciles the
//! checkpoint with the `bundles/<id>-result.json` files workers leave
//! behind: the result file is the tie-breaker because it is the only
//! artifact that survives a worker-process failure after state was
//! updated but before the orchestrator observed the return.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{CheckpointError, CoreError, CoreResult};
use crate::state::document::{StateDocument, TaskStatus};

/// Name of the checkpoint sidecar file.
pub const CHECKPOINT_FILE: &str = "orchestrator-checkpoint.json";

/// Status of the recorded batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Active,
    Complete,
}

/// Worker outcome for a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failed,
}

impl std::str::FromStr for TaskOutcome {
    type Err = crate::errors::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(TaskOutcome::Success),
            "failed" => Ok(TaskOutcome::Failed),
            other => Err(crate::errors::ConfigError::Invalid(format!(
                "outcome must be 'success' or 'failed', got '{other}'"
            ))),
        }
    }
}

/// Task lists of the current batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointTasks {
    #[serde(default)]
    pub pending: Vec<String>,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

impl CheckpointTasks {
    fn remove(&mut self, id: &str) {
        self.pending.retain(|t| t != id);
        self.completed.retain(|t| t != id);
        self.failed.retain(|t| t != id);
    }

    fn contains(&self, id: &str) -> bool {
        self.pending.iter().any(|t| t == id)
            || self.completed.iter().any(|t| t == id)
            || self.failed.iter().any(|t| t == id)
    }
}

/// Durable record of an in-flight batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub batch_id: String,
    pub spawned_at: DateTime<Utc>,
    pub status: BatchStatus,
    pub tasks: CheckpointTasks,
    pub updated_at: DateTime<Utc>,
}

/// Worker result file written under `bundles/<task>-result.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerResult {
    #[serde(default)]
    #[allow(dead_code)]
    pub version: Option<String>,
    pub task_id: String,
    pub status: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: WorkerFiles,
    #[serde(default)]
    pub verification: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<WorkerError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerFiles {
    #[serde(default)]
    pub created: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerError {
    pub category: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// One task reclassified during crash recovery.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveredTask {
    pub id: String,
    pub outcome: TaskOutcome,
}

/// Outcome of a `recover` pass. The caller decides what to do with orphans.
#[derive(Debug, Default, Serialize)]
pub struct BatchRecovery {
    pub recovered: Vec<RecoveredTask>,
    pub orphaned: Vec<String>,
}

impl BatchRecovery {
    /// Drift means the checkpoint disagreed with on-disk reality.
    pub fn has_drift(&self) -> bool {
        !self.recovered.is_empty() || !self.orphaned.is_empty()
    }
}

/// Coordinator bound to a planning directory.
pub struct CheckpointCoordinator {
    dir: PathBuf,
}

impl CheckpointCoordinator {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir.join(format!("{CHECKPOINT_FILE}.tmp"))
    }

    /// Check whether a batch is in flight.
    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Record a new batch. Overwrites any previous checkpoint.
    pub fn create(&self, ids: Vec<String>) -> CoreResult<Checkpoint> {
        let now = Utc::now();
        let checkpoint = Checkpoint {
            batch_id: Uuid::new_v4().to_string(),
            spawned_at: now,
            status: BatchStatus::Active,
            tasks: CheckpointTasks {
                pending: ids,
                completed: Vec::new(),
                failed: Vec::new(),
            },
            updated_at: now,
        };
        self.write(&checkpoint)?;
        info!(batch = %checkpoint.batch_id, pending = checkpoint.tasks.pending.len(), "checkpoint created");
        Ok(checkpoint)
    }

    /// Load the current checkpoint.
    pub fn load(&self) -> CoreResult<Checkpoint> {
        let path = self.path();
        if !path.exists() {
            return Err(CheckpointError::NotFound { path }.into());
        }
        let raw = fs::read_to_string(&path).map_err(|source| CoreError::ReadFailed {
            path: path.clone(),
            source,
        })?;
        let checkpoint =
            serde_json::from_str(&raw).map_err(|e| CheckpointError::Corrupt {
                path,
                detail: e.to_string(),
            })?;
        Ok(checkpoint)
    }

    /// Move a task to the list indicated by its outcome. Idempotent: a
    /// repeat call with the same outcome changes nothing.
    pub fn update(&self, id: &str, outcome: TaskOutcome) -> CoreResult<Checkpoint> {
        let mut checkpoint = self.load()?;
        if !checkpoint.tasks.contains(id) {
            return Err(CheckpointError::UnknownTask { id: id.to_string() }.into());
        }

        let already_there = match outcome {
            TaskOutcome::Success => checkpoint.tasks.completed.iter().any(|t| t == id),
            TaskOutcome::Failed => checkpoint.tasks.failed.iter().any(|t| t == id),
        };
        if already_there {
            return Ok(checkpoint);
        }

        checkpoint.tasks.remove(id);
        match outcome {
            TaskOutcome::Success => checkpoint.tasks.completed.push(id.to_string()),
            TaskOutcome::Failed => checkpoint.tasks.failed.push(id.to_string()),
        }
        checkpoint.updated_at = Utc::now();
        self.write(&checkpoint)?;
        Ok(checkpoint)
    }

    /// Mark the batch complete. The file remains for audit until `clear`.
    pub fn complete(&self) -> CoreResult<Checkpoint> {
        let mut checkpoint = self.load()?;
        checkpoint.status = BatchStatus::Complete;
        checkpoint.updated_at = Utc::now();
        self.write(&checkpoint)?;
        info!(batch = %checkpoint.batch_id, "checkpoint complete");
        Ok(checkpoint)
    }

    /// Remove the checkpoint file. A missing file is not an error.
    pub fn clear(&self) -> CoreResult<()> {
        let path = self.path();
        if path.exists() {
            fs::remove_file(&path).map_err(|source| CheckpointError::WriteFailed {
                path,
                source,
            })?;
        }
        Ok(())
    }

    /// Reconcile the checkpoint against worker result files after a crash.
    ///
    /// Every pending ID with a `bundles/<id>-result.json` moves to the
    /// list its `status` field indicates. A pending ID with no result file
    /// whose task is recorded as `running` in state is orphaned; the
    /// caller decides whether to retry or skip it.
    pub fn recover(&self, doc: &StateDocument) -> CoreResult<BatchRecovery> {
        let mut checkpoint = self.load()?;
        let mut recovery = BatchRecovery::default();

        let pending = checkpoint.tasks.pending.clone();
        for id in pending {
            match self.read_worker_result(&id)? {
                Some(result) => {
                    let outcome: TaskOutcome = result.status.parse()?;
                    checkpoint.tasks.remove(&id);
                    match outcome {
                        TaskOutcome::Success => checkpoint.tasks.completed.push(id.clone()),
                        TaskOutcome::Failed => checkpoint.tasks.failed.push(id.clone()),
                    }
                    recovery.recovered.push(RecoveredTask { id, outcome });
                }
                None => {
                    let running = doc
                        .tasks
                        .get(&id)
                        .is_some_and(|t| t.status == TaskStatus::Running);
                    if running {
                        warn!(task = %id, "orphaned: running in state with no result file");
                        recovery.orphaned.push(id);
                    }
                }
            }
        }

        if !recovery.recovered.is_empty() {
            checkpoint.updated_at = Utc::now();
            self.write(&checkpoint)?;
        }
        info!(
            recovered = recovery.recovered.len(),
            orphaned = recovery.orphaned.len(),
            "checkpoint recovery finished"
        );
        Ok(recovery)
    }

    /// Parse `bundles/<id>-result.json` if present.
    pub fn read_worker_result(&self, id: &str) -> CoreResult<Option<WorkerResult>> {
        let path = self.dir.join("bundles").join(format!("{id}-result.json"));
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|source| CoreError::ReadFailed {
            path: path.clone(),
            source,
        })?;
        let result: WorkerResult =
            serde_json::from_str(&raw).map_err(|e| CheckpointError::Corrupt {
                path,
                detail: e.to_string(),
            })?;
        Ok(Some(result))
    }

    fn write(&self, checkpoint: &Checkpoint) -> CoreResult<()> {
        let tmp = self.tmp_path();
        let target = self.path();
        let mut json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| CoreError::Internal(anyhow::anyhow!("checkpoint serialization: {e}")))?;
        json.push('\n');
        fs::write(&tmp, json.as_bytes()).map_err(|source| CheckpointError::WriteFailed {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &target).map_err(|source| CheckpointError::WriteFailed {
            path: target,
            source,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::document::Task;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn setup() -> (CheckpointCoordinator, TempDir) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("bundles")).unwrap();
        let coordinator = CheckpointCoordinator::new(dir.path());
        (coordinator, dir)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn write_result(dir: &TempDir, id: &str, status: &str) {
        let body = serde_json::json!({
            "version": "1",
            "task_id": id,
            "status": status,
            "files": {"created": [], "modified": []}
        });
        fs::write(
            dir.path().join("bundles").join(format!("{id}-result.json")),
            serde_json::to_string(&body).unwrap(),
        )
        .unwrap();
    }

    fn doc_with_running(ids: &[&str]) -> StateDocument {
        let mut doc = StateDocument::new("/repo");
        for id in ids {
            let mut task = Task::new(
                id,
                &format!("Task {id}"),
                1,
                BTreeSet::new(),
                BTreeSet::new(),
                &format!("{id}.json"),
            );
            task.status = TaskStatus::Running;
            doc.tasks.insert(id.to_string(), task);
        }
        doc
    }

    #[test]
    fn test_create_load_round_trip() {
        let (coordinator, _dir) = setup();
        let created = coordinator.create(ids(&["T001", "T002"])).unwrap();
        assert_eq!(created.status, BatchStatus::Active);

        let loaded = coordinator.load().unwrap();
        assert_eq!(loaded.batch_id, created.batch_id);
        assert_eq!(loaded.tasks.pending, vec!["T001", "T002"]);
        assert!(loaded.tasks.completed.is_empty());
    }

    #[test]
    fn test_absence_means_no_batch() {
        let (coordinator, _dir) = setup();
        assert!(!coordinator.exists());
        let err = coordinator.load().unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn test_update_moves_between_lists() {
        let (coordinator, _dir) = setup();
        coordinator.create(ids(&["T001", "T002"])).unwrap();

        let cp = coordinator.update("T001", TaskOutcome::Success).unwrap();
        assert_eq!(cp.tasks.pending, vec!["T002"]);
        assert_eq!(cp.tasks.completed, vec!["T001"]);

        // Re-classification moves the ID again rather than duplicating it.
        let cp = coordinator.update("T001", TaskOutcome::Failed).unwrap();
        assert!(cp.tasks.completed.is_empty());
        assert_eq!(cp.tasks.failed, vec!["T001"]);
    }

    #[test]
    fn test_update_is_idempotent() {
        let (coordinator, _dir) = setup();
        coordinator.create(ids(&["T001"])).unwrap();

        let first = coordinator.update("T001", TaskOutcome::Success).unwrap();
        let second = coordinator.update("T001", TaskOutcome::Success).unwrap();

        assert_eq!(second.tasks.completed, vec!["T001"]);
        assert_eq!(second.updated_at, first.updated_at, "no-op does not rewrite");
    }

    #[test]
    fn test_update_unknown_task_rejected() {
        let (coordinator, _dir) = setup();
        coordinator.create(ids(&["T001"])).unwrap();
        let err = coordinator.update("T999", TaskOutcome::Success).unwrap_err();
        assert!(err.to_string().contains("not part of the current batch"));
    }

    #[test]
    fn test_complete_then_clear() {
        let (coordinator, _dir) = setup();
        coordinator.create(ids(&["T001"])).unwrap();

        let cp = coordinator.complete().unwrap();
        assert_eq!(cp.status, BatchStatus::Complete);
        assert!(coordinator.exists(), "file stays for audit");

        coordinator.clear().unwrap();
        assert!(!coordinator.exists());
        // Clearing again is fine.
        coordinator.clear().unwrap();
    }

    #[test]
    fn test_recover_reads_result_files_and_reports_orphans() {
        let (coordinator, dir) = setup();
        coordinator.create(ids(&["T001", "T002", "T003"])).unwrap();
        write_result(&dir, "T002", "success");
        write_result(&dir, "T003", "failed");

        let doc = doc_with_running(&["T001", "T002", "T003"]);
        let recovery = coordinator.recover(&doc).unwrap();

        assert_eq!(recovery.recovered.len(), 2);
        assert!(recovery
            .recovered
            .iter()
            .any(|r| r.id == "T002" && r.outcome == TaskOutcome::Success));
        assert!(recovery
            .recovered
            .iter()
            .any(|r| r.id == "T003" && r.outcome == TaskOutcome::Failed));
        assert_eq!(recovery.orphaned, vec!["T001"]);
        assert!(recovery.has_drift());

        let cp = coordinator.load().unwrap();
        assert_eq!(cp.tasks.pending, vec!["T001"]);
        assert_eq!(cp.tasks.completed, vec!["T002"]);
        assert_eq!(cp.tasks.failed, vec!["T003"]);
    }

    #[test]
    fn test_recover_ignores_non_running_pending() {
        let (coordinator, _dir) = setup();
        coordinator.create(ids(&["T001"])).unwrap();

        // Task never started according to state: not an orphan.
        let mut doc = StateDocument::new("/repo");
        doc.tasks.insert(
            "T001".into(),
            Task::new("T001", "Pending task", 1, BTreeSet::new(), BTreeSet::new(), "T001.json"),
        );

        let recovery = coordinator.recover(&doc).unwrap();
        assert!(recovery.recovered.is_empty());
        assert!(recovery.orphaned.is_empty());
        assert!(!recovery.has_drift());
    }

    #[test]
    fn test_worker_result_parses_full_shape() {
        let (coordinator, dir) = setup();
        let body = serde_json::json!({
            "version": "1",
            "task_id": "T001",
            "status": "failed",
            "started_at": "2026-07-01T10:00:00Z",
            "completed_at": "2026-07-01T10:05:00Z",
            "files": {"created": ["src/a.rs"], "modified": []},
            "error": {"category": "build", "message": "compile error", "retryable": true}
        });
        fs::write(
            dir.path().join("bundles/T001-result.json"),
            serde_json::to_string(&body).unwrap(),
        )
        .unwrap();

        let result = coordinator.read_worker_result("T001").unwrap().unwrap();
        assert_eq!(result.task_id, "T001");
        assert_eq!(result.status, "failed");
        assert_eq!(result.files.created, vec!["src/a.rs"]);
        let error = result.error.unwrap();
        assert_eq!(error.category, "build");
        assert!(error.retryable);
    }
}
