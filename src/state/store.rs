//! State store and lock manager.
//!
//! Both `load` and `save` take an advisory lock on the `state.json.lock`
//! sidecar (shared for reads, exclusive for writes). Writes serialize to
//! `state.json.tmp` and atomically rename over `state.json`, so a failure
//! mid-write never touches the target. Lock acquisition is bounded by a
//! 10-second timeout and surfaces as `state:LOCKED`.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::errors::{CoreError, CoreResult, StateError};
use crate::phase::PHASE_ORDER;
use crate::state::document::{StateDocument, STATE_VERSION};

/// How long lock acquisition may block before surfacing `state:LOCKED`.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for the advisory lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Subdirectories created under the planning directory by `init`.
const PLANNING_SUBDIRS: [&str; 5] = ["inputs", "tasks", "artifacts", "artifacts/fsm", "bundles"];

fn task_id_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^T\d{3,}$").expect("task ID regex is valid"))
}

/// Check a task ID against the required `T###` shape.
pub fn is_valid_task_id(id: &str) -> bool {
    task_id_regex().is_match(id)
}

/// Mode for advisory lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

/// RAII guard over the advisory lock. Unlocks on drop.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!(error = %e, "failed to release state lock");
        }
    }
}

/// Handle to a planning directory's authoritative state.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// The planning directory this store manages.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join("state.json.lock")
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir.join("state.json.tmp")
    }

    /// Check whether `state.json` exists.
    pub fn exists(&self) -> bool {
        self.state_path().exists()
    }

    /// Acquire the advisory lock, polling up to `LOCK_TIMEOUT`.
    fn acquire_lock(&self, mode: LockMode) -> CoreResult<LockGuard> {
        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| CoreError::from(StateError::WriteFailed {
                path: lock_path.clone(),
                source,
            }))?;

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            let acquired = match mode {
                LockMode::Shared => fs2::FileExt::try_lock_shared(&file).is_ok(),
                LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(&file).is_ok(),
            };
            if acquired {
                debug!(path = %lock_path.display(), ?mode, "acquired state lock");
                return Ok(LockGuard { file });
            }
            if Instant::now() >= deadline {
                return Err(StateError::Locked { path: lock_path }.into());
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Create the planning directory skeleton and the initial state document.
    ///
    /// Idempotent: an existing `state.json` is loaded and returned unchanged.
    pub fn init(&self, target_dir: &str) -> CoreResult<(StateDocument, bool)> {
        if target_dir.trim().is_empty() {
            return Err(StateError::Invalid {
                violations: vec!["target_dir must be non-empty".into()],
            }
            .into());
        }

        fs::create_dir_all(&self.dir).map_err(|source| CoreError::IoWriteFailed {
            path: self.dir.clone(),
            source,
        })?;
        for sub in PLANNING_SUBDIRS {
            let path = self.dir.join(sub);
            fs::create_dir_all(&path)
                .map_err(|source| CoreError::IoWriteFailed { path, source })?;
        }

        if self.exists() {
            return Ok((self.load()?, false));
        }

        let mut doc = StateDocument::new(target_dir);
        doc.append_event(
            "state_initialized",
            None,
            serde_json::json!({ "target_dir": target_dir }),
        );
        self.save(&mut doc)?;
        Ok((doc, true))
    }

    /// Load and validate the state document under a shared lock.
    pub fn load(&self) -> CoreResult<StateDocument> {
        let _guard = self.acquire_lock(LockMode::Shared)?;
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> CoreResult<StateDocument> {
        let path = self.state_path();
        if !path.exists() {
            return Err(StateError::NotFound { path }.into());
        }
        let raw = fs::read_to_string(&path).map_err(|source| CoreError::ReadFailed {
            path: path.clone(),
            source,
        })?;
        let doc: StateDocument =
            serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
                path: path.clone(),
                detail: e.to_string(),
            })?;

        let violations = validate_document(&doc);
        if !violations.is_empty() {
            return Err(StateError::Invalid { violations }.into());
        }
        Ok(doc)
    }

    /// Persist the document under an exclusive lock.
    ///
    /// Stamps `updated_at`, serializes to canonical 2-space-indent JSON,
    /// writes `state.json.tmp`, then renames over `state.json`.
    pub fn save(&self, doc: &mut StateDocument) -> CoreResult<()> {
        let _guard = self.acquire_lock(LockMode::Exclusive)?;
        self.save_unlocked(doc)
    }

    fn save_unlocked(&self, doc: &mut StateDocument) -> CoreResult<()> {
        doc.updated_at = chrono::Utc::now();

        let mut json = serde_json::to_string_pretty(doc)
            .map_err(|e| CoreError::Internal(anyhow::anyhow!("state serialization: {e}")))?;
        json.push('\n');

        let tmp = self.tmp_path();
        let target = self.state_path();
        fs::write(&tmp, json.as_bytes()).map_err(|source| StateError::WriteFailed {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &target).map_err(|source| StateError::WriteFailed {
            path: target.clone(),
            source,
        })?;
        debug!(path = %target.display(), "saved state");
        Ok(())
    }

    /// Run a mutation as a single transaction: exclusive lock, load,
    /// mutate, save. The lock is held across the whole closure so no
    /// other process observes the intermediate state.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut StateDocument) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let _guard = self.acquire_lock(LockMode::Exclusive)?;
        let mut doc = self.load_unlocked()?;
        let result = f(&mut doc)?;
        self.save_unlocked(&mut doc)?;
        Ok(result)
    }
}

/// Pure structural validation over a loaded document.
///
/// Returns an ordered list of violations; a non-empty list means the
/// state is corrupt and recovery should run.
pub fn validate_document(doc: &StateDocument) -> Vec<String> {
    let mut violations = Vec::new();

    if doc.version != STATE_VERSION {
        violations.push(format!(
            "version must be \"{STATE_VERSION}\", found \"{}\"",
            doc.version
        ));
    }
    if doc.target_dir.trim().is_empty() {
        violations.push("target_dir must be non-empty".to_string());
    }
    if !PHASE_ORDER.contains(&doc.phase.current) {
        violations.push(format!("phase.current '{}' is not a known phase", doc.phase.current));
    }
    for (key, task) in &doc.tasks {
        if task.id.is_empty() {
            violations.push(format!("task under key '{key}' has an empty id"));
        } else if task.id != *key {
            violations.push(format!(
                "task key '{key}' does not match task id '{}'",
                task.id
            ));
        }
        if !is_valid_task_id(key) {
            violations.push(format!("task id '{key}' does not match T###"));
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::document::{Task, TaskStatus};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn store() -> (StateStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        (store, dir)
    }

    #[test]
    fn test_init_creates_skeleton_and_state() {
        let (store, dir) = store();
        let (doc, created) = store.init("/repo").unwrap();

        assert!(created);
        assert_eq!(doc.version, STATE_VERSION);
        assert!(dir.path().join("state.json").exists());
        assert!(dir.path().join("inputs").is_dir());
        assert!(dir.path().join("tasks").is_dir());
        assert!(dir.path().join("artifacts/fsm").is_dir());
        assert!(dir.path().join("bundles").is_dir());
    }

    #[test]
    fn test_init_is_idempotent() {
        let (store, _dir) = store();
        let (first, created) = store.init("/repo").unwrap();
        assert!(created);

        let (second, created_again) = store.init("/other").unwrap();
        assert!(!created_again);
        // Existing state is returned unchanged, not re-targeted
        assert_eq!(second.target_dir, first.target_dir);
    }

    #[test]
    fn test_init_rejects_empty_target() {
        let (store, _dir) = store();
        let result = store.init("  ");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let (store, _dir) = store();
        let (mut doc, _) = store.init("/repo").unwrap();

        doc.tasks.insert(
            "T001".into(),
            Task::new("T001", "First", 1, BTreeSet::new(), BTreeSet::new(), "T001.json"),
        );
        store.save(&mut doc).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks["T001"].status, TaskStatus::Pending);
        assert_eq!(loaded.target_dir, "/repo");
    }

    #[test]
    fn test_save_stamps_updated_at() {
        let (store, _dir) = store();
        let (mut doc, _) = store.init("/repo").unwrap();
        let before = doc.updated_at;

        std::thread::sleep(Duration::from_millis(10));
        store.save(&mut doc).unwrap();
        assert!(doc.updated_at > before);
    }

    #[test]
    fn test_save_leaves_no_tmp_file() {
        let (store, dir) = store();
        let (mut doc, _) = store.init("/repo").unwrap();
        store.save(&mut doc).unwrap();
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_load_missing_state_is_not_found() {
        let (store, _dir) = store();
        let err = store.load().unwrap_err();
        assert_eq!(err.category(), "state");
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let (store, dir) = store();
        store.init("/repo").unwrap();
        fs::write(dir.path().join("state.json"), "{ invalid").unwrap();

        let err = store.load().unwrap_err();
        assert_eq!(err.code(), "CORRUPT");
    }

    #[test]
    fn test_update_runs_transactionally() {
        let (store, _dir) = store();
        store.init("/repo").unwrap();

        store
            .update(|doc| {
                doc.tasks.insert(
                    "T001".into(),
                    Task::new("T001", "First", 1, BTreeSet::new(), BTreeSet::new(), "T001.json"),
                );
                doc.append_event("task_loaded", Some("T001"), serde_json::Value::Null);
                Ok(())
            })
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.events.last().unwrap().kind, "task_loaded");
    }

    #[test]
    fn test_update_failure_leaves_state_untouched() {
        let (store, _dir) = store();
        store.init("/repo").unwrap();

        let result: CoreResult<()> = store.update(|doc| {
            doc.tasks.insert(
                "T001".into(),
                Task::new("T001", "First", 1, BTreeSet::new(), BTreeSet::new(), "T001.json"),
            );
            Err(crate::errors::TaskError::NotFound("T999".into()).into())
        });
        assert!(result.is_err());

        let loaded = store.load().unwrap();
        assert!(loaded.tasks.is_empty(), "failed transaction must not persist");
    }

    #[test]
    fn test_validate_document_checks() {
        let mut doc = StateDocument::new("/repo");
        assert!(validate_document(&doc).is_empty());

        doc.version = "1.0".into();
        doc.target_dir = "".into();
        doc.tasks.insert(
            "bogus".into(),
            Task::new("bogus", "Bad", 1, BTreeSet::new(), BTreeSet::new(), "b.json"),
        );

        let violations = validate_document(&doc);
        assert!(violations.iter().any(|v| v.contains("version")));
        assert!(violations.iter().any(|v| v.contains("target_dir")));
        assert!(violations.iter().any(|v| v.contains("T###")));
    }

    #[test]
    fn test_task_id_shape() {
        assert!(is_valid_task_id("T001"));
        assert!(is_valid_task_id("T0421"));
        assert!(!is_valid_task_id("T01"));
        assert!(!is_valid_task_id("X001"));
        assert!(!is_valid_task_id("T001b"));
    }

    #[test]
    fn test_concurrent_shared_reads_do_not_block() {
        let (store, _dir) = store();
        store.init("/repo").unwrap();
        // Two sequential loads exercise shared-lock acquisition and release.
        store.load().unwrap();
        store.load().unwrap();
    }
}
