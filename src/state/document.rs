//! The authoritative state document and its constituent types.
//!
//! `state.json` is the single source of truth for a planning directory.
//! Everything here is plain serde data; all mutation goes through the
//! lifecycle operations so counters and events stay consistent with task
//! status in the same transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::phase::PhaseName;

/// Fixed schema version for `state.json`.
pub const STATE_VERSION: &str = "2.0";

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting for dependencies or scheduling
    #[default]
    Pending,
    /// Dependencies satisfied, offered to the scheduler
    Ready,
    /// A worker owns the task
    Running,
    /// Task finished successfully
    Complete,
    /// Task finished with an error
    Failed,
    /// A predecessor's verification blocked this task
    Blocked,
    /// Task was skipped; satisfies dependents like `complete`
    Skipped,
}

impl TaskStatus {
    /// Wire form of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Skipped => "skipped",
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Skipped)
    }

    /// Check if the status satisfies a dependent's readiness check.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }

    /// Check if the status can transition into `running`.
    pub fn is_startable(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }

    /// All wire forms, for validation of string inputs.
    pub fn all() -> &'static [&'static str] {
        &[
            "pending", "ready", "running", "complete", "failed", "blocked", "skipped",
        ]
    }
}

/// Failure metadata attached when a task fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Failure category reported by the worker (e.g. "build", "timeout")
    pub category: String,
    /// Whether `retry-task` may reset the task to pending
    pub retryable: bool,
}

/// Verdict recorded by the LLM judge for a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationVerdict {
    Pass,
    Fail,
    Conditional,
}

/// Whether successors may proceed after verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationRecommendation {
    Proceed,
    Block,
}

/// Verification payload recorded by the LLM judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub verdict: VerificationVerdict,
    pub recommendation: VerificationRecommendation,
    /// Per-criterion outcomes, opaque to the engine
    #[serde(default)]
    pub criteria: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<serde_json::Value>,
    pub verified_at: DateTime<Utc>,
}

/// A unit of work with an ID, dependencies, and a lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task ID of the shape `T###`
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Execution phase number; dependencies must sit in an equal-or-earlier phase
    pub phase: u32,
    /// IDs of tasks that must finish before this one starts
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// IDs of tasks a BLOCK verdict on this task would block
    #[serde(default)]
    pub blocks: BTreeSet<String>,
    /// Source filename under `tasks/`
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_created: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_modified: Option<Vec<String>>,
    /// Number of times the task has entered `running`
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
}

impl Task {
    /// Create a freshly-loaded task with initial status `pending`.
    pub fn new(
        id: &str,
        name: &str,
        phase: u32,
        depends_on: BTreeSet<String>,
        blocks: BTreeSet<String>,
        file: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: TaskStatus::Pending,
            phase,
            depends_on,
            blocks,
            file: file.to_string(),
            started_at: None,
            completed_at: None,
            error: None,
            failure: None,
            files_created: None,
            files_modified: None,
            attempts: 0,
            duration_seconds: None,
            verification: None,
        }
    }

    /// Clear the engine-owned mutable subset ahead of a retry.
    /// `attempts` is preserved across retries.
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.failure = None;
        self.files_created = None;
        self.files_modified = None;
        self.duration_seconds = None;
        self.verification = None;
    }
}

/// Record of a validated planning artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Path relative to the planning directory
    pub path: String,
    /// First 16 hex chars of the SHA256 of the artifact file
    pub checksum: String,
    pub valid: bool,
    pub validated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// LLM-judge verdict over the full task set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskValidation {
    /// One of READY, READY_WITH_NOTES, NEEDS_WORK
    pub verdict: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub validated_at: DateTime<Utc>,
}

impl TaskValidation {
    /// Check if the verdict permits advancing into `sequencing`.
    pub fn permits_sequencing(&self) -> bool {
        matches!(self.verdict.as_str(), "READY" | "READY_WITH_NOTES")
    }
}

/// Planning artifacts and gate outcomes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_map: Option<ArtifactRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_map: Option<ArtifactRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_graph: Option<ArtifactRecord>,
    /// Planning gate outcomes recorded during `definition`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_results: Option<ValidationResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_validation: Option<TaskValidation>,
}

impl Artifacts {
    /// Look up an artifact record by kind name.
    pub fn get(&self, kind: &str) -> Option<&ArtifactRecord> {
        match kind {
            "capability_map" => self.capability_map.as_ref(),
            "physical_map" => self.physical_map.as_ref(),
            "dependency_graph" => self.dependency_graph.as_ref(),
            _ => None,
        }
    }

    /// Store an artifact record by kind name. Unknown kinds are rejected upstream.
    pub fn set(&mut self, kind: &str, record: ArtifactRecord) {
        match kind {
            "capability_map" => self.capability_map = Some(record),
            "physical_map" => self.physical_map = Some(record),
            "dependency_graph" => self.dependency_graph = Some(record),
            _ => {}
        }
    }
}

/// Outcome of a single planning gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Planning gate outcomes (coverage, phase leakage, dependency existence,
/// criterion quality) recorded before `definition -> validation`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResults {
    #[serde(default)]
    pub gates: Vec<GateResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl ValidationResults {
    /// Check if every recorded gate passed.
    pub fn all_passed(&self) -> bool {
        !self.gates.is_empty() && self.gates.iter().all(|g| g.passed)
    }

    /// Names of failed gates, for precondition error messages.
    pub fn failed_gates(&self) -> Vec<&str> {
        self.gates
            .iter()
            .filter(|g| !g.passed)
            .map(|g| g.gate.as_str())
            .collect()
    }
}

/// Current and completed phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub current: PhaseName,
    #[serde(default)]
    pub completed: Vec<PhaseName>,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self {
            current: PhaseName::Ingestion,
            completed: Vec::new(),
        }
    }
}

/// Execution counters. Recomputable from the task map; recovery does exactly that.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Phase number of the most recently started task
    #[serde(default)]
    pub current_phase: u32,
    /// IDs of tasks currently `running`
    #[serde(default)]
    pub active_tasks: BTreeSet<String>,
    /// Count of tasks with status `complete` or `skipped`
    #[serde(default)]
    pub completed_count: u64,
    /// Count of tasks with status `failed`
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

/// Halt request metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaltState {
    pub requested: bool,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_task: Option<String>,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

/// The authoritative state document persisted as `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    /// Fixed literal "2.0"
    pub version: String,
    /// Absolute path of the code repository under management
    pub target_dir: String,
    #[serde(with = "rfc3339_nanos")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "rfc3339_nanos")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub phase: PhaseState,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
    #[serde(default)]
    pub execution: ExecutionStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt: Option<HaltState>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl StateDocument {
    /// Create the initial state for a planning directory.
    pub fn new(target_dir: &str) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION.to_string(),
            target_dir: target_dir.to_string(),
            created_at: now,
            updated_at: now,
            phase: PhaseState::default(),
            artifacts: Artifacts::default(),
            tasks: BTreeMap::new(),
            execution: ExecutionStats::default(),
            halt: None,
            events: Vec::new(),
        }
    }

    /// Append an audit event. Events are never removed or reordered.
    pub fn append_event(&mut self, kind: &str, task_id: Option<&str>, details: serde_json::Value) {
        self.events.push(Event {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            task_id: task_id.map(String::from),
            details,
        });
    }

    /// Recompute `execution` counters from the task map.
    ///
    /// Token and cost totals are preserved; everything else is derived.
    pub fn recompute_counters(&mut self) {
        let completed = self
            .tasks
            .values()
            .filter(|t| t.status.satisfies_dependency())
            .count() as u64;
        let failed = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .count() as u64;
        let active: BTreeSet<String> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone())
            .collect();
        self.execution.completed_count = completed;
        self.execution.failed_count = failed;
        self.execution.active_tasks = active;
    }

    /// Check if every task has reached `complete` or `skipped`.
    pub fn all_tasks_done(&self) -> bool {
        !self.tasks.is_empty()
            && self
                .tasks
                .values()
                .all(|t| t.status.satisfies_dependency())
    }

    /// Count tasks by status.
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for status in TaskStatus::all() {
            counts.insert(status, 0);
        }
        for task in self.tasks.values() {
            *counts.entry(task.status.as_str()).or_insert(0) += 1;
        }
        counts
    }

}

/// Serde helpers pinning the on-disk timestamp convention to RFC3339 with
/// nanosecond precision in UTC.
mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
