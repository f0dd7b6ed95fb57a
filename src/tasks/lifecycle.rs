//! Task lifecycle operations.
//!
//! These are the core's authority over task state. Each operation runs as
//! one transaction: acquire the exclusive lock, load state, mutate, save.
//! Counters in `execution` change in the same transaction as the status
//! they derive from, so readers see both or neither.

use chrono::Utc;
use tracing::info;

use crate::errors::{CoreResult, TaskError};
use crate::phase::PhaseName;
use crate::state::document::{
    StateDocument, Task, TaskFailure, TaskStatus, Verification, VerificationRecommendation,
};
use crate::state::store::StateStore;
use crate::tasks::dag;

/// Lifecycle operations bound to a planning directory's store.
pub struct TaskLifecycle<'a> {
    store: &'a StateStore,
}

impl<'a> TaskLifecycle<'a> {
    pub fn new(store: &'a StateStore) -> Self {
        Self { store }
    }

    /// Transition a task from pending/ready to running.
    ///
    /// Stamps `started_at`, increments `attempts`, adds the task to the
    /// active set, and on the first start moves the pipeline from `ready`
    /// to `executing`.
    pub fn start_task(&self, id: &str) -> CoreResult<Task> {
        let id = id.to_string();
        self.store.update(move |doc| {
            let task = get_task_mut(doc, &id)?;
            if !task.status.is_startable() {
                return Err(TaskError::InvalidTransition {
                    id: id.clone(),
                    status: task.status.as_str().to_string(),
                    expected: "pending, ready".to_string(),
                }
                .into());
            }

            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.attempts += 1;
            let phase = task.phase;
            let snapshot = task.clone();

            doc.execution.active_tasks.insert(id.clone());
            doc.execution.current_phase = phase;

            // First start-task implicitly moves the pipeline into execution.
            if doc.phase.current == PhaseName::Ready {
                doc.phase.completed.push(PhaseName::Ready);
                doc.phase.current = PhaseName::Executing;
                doc.append_event(
                    "phase_advanced",
                    None,
                    serde_json::json!({ "from": "ready", "to": "executing" }),
                );
            }

            doc.append_event(
                "task_started",
                Some(&id),
                serde_json::json!({ "attempt": snapshot.attempts }),
            );
            info!(task = %id, attempt = snapshot.attempts, "task started");
            Ok(snapshot)
        })
    }

    /// Transition a running task to complete, recording file lists and duration.
    pub fn complete_task(
        &self,
        id: &str,
        created: Vec<String>,
        modified: Vec<String>,
    ) -> CoreResult<Task> {
        let id = id.to_string();
        self.store.update(move |doc| {
            let task = get_task_mut(doc, &id)?;
            require_status(task, TaskStatus::Running, "running")?;

            let now = Utc::now();
            task.status = TaskStatus::Complete;
            task.completed_at = Some(now);
            task.duration_seconds = task
                .started_at
                .map(|s| (now - s).num_milliseconds() as f64 / 1000.0);
            task.files_created = Some(created);
            task.files_modified = Some(modified);
            let snapshot = task.clone();

            doc.execution.active_tasks.remove(&id);
            doc.execution.completed_count += 1;

            doc.append_event(
                "task_completed",
                Some(&id),
                serde_json::json!({
                    "duration_seconds": snapshot.duration_seconds,
                    "files_created": snapshot.files_created.as_deref().map(<[String]>::len),
                    "files_modified": snapshot.files_modified.as_deref().map(<[String]>::len),
                }),
            );
            info!(task = %id, "task completed");
            Ok(snapshot)
        })
    }

    /// Transition a running task to failed, attaching failure metadata.
    pub fn fail_task(
        &self,
        id: &str,
        message: &str,
        category: &str,
        retryable: bool,
    ) -> CoreResult<Task> {
        let id = id.to_string();
        let message = message.to_string();
        let category = category.to_string();
        self.store.update(move |doc| {
            let task = get_task_mut(doc, &id)?;
            require_status(task, TaskStatus::Running, "running")?;

            let now = Utc::now();
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            task.duration_seconds = task
                .started_at
                .map(|s| (now - s).num_milliseconds() as f64 / 1000.0);
            task.error = Some(message.clone());
            task.failure = Some(TaskFailure {
                category: category.clone(),
                retryable,
            });
            let snapshot = task.clone();

            doc.execution.active_tasks.remove(&id);
            doc.execution.failed_count += 1;

            doc.append_event(
                "task_failed",
                Some(&id),
                serde_json::json!({
                    "error": message,
                    "category": category,
                    "retryable": retryable,
                }),
            );
            info!(task = %id, category = %category, retryable, "task failed");
            Ok(snapshot)
        })
    }

    /// Reset a retryable failed task back to pending.
    ///
    /// Clears timing, error, failure, files, and verification; preserves
    /// `attempts` so the retry count survives.
    pub fn retry_task(&self, id: &str) -> CoreResult<Task> {
        let id = id.to_string();
        self.store.update(move |doc| {
            let task = get_task_mut(doc, &id)?;
            require_status(task, TaskStatus::Failed, "failed")?;
            if !task.failure.as_ref().is_some_and(|f| f.retryable) {
                return Err(TaskError::NotRetryable { id: id.clone() }.into());
            }

            task.reset_for_retry();
            let snapshot = task.clone();

            doc.execution.failed_count = doc.execution.failed_count.saturating_sub(1);
            doc.append_event(
                "task_retried",
                Some(&id),
                serde_json::json!({ "attempts": snapshot.attempts }),
            );
            info!(task = %id, "task reset for retry");
            Ok(snapshot)
        })
    }

    /// Skip a task that has not run. Skipped tasks satisfy dependency
    /// readiness for their successors.
    pub fn skip_task(&self, id: &str, reason: &str) -> CoreResult<Task> {
        let id = id.to_string();
        let reason = reason.to_string();
        self.store.update(move |doc| {
            let task = get_task_mut(doc, &id)?;
            if !matches!(
                task.status,
                TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Blocked
            ) {
                return Err(TaskError::InvalidTransition {
                    id: id.clone(),
                    status: task.status.as_str().to_string(),
                    expected: "pending, ready, blocked".to_string(),
                }
                .into());
            }

            task.status = TaskStatus::Skipped;
            task.error = Some(reason.clone());
            let snapshot = task.clone();

            doc.execution.completed_count += 1;
            doc.append_event(
                "task_skipped",
                Some(&id),
                serde_json::json!({ "reason": reason }),
            );
            info!(task = %id, "task skipped");
            Ok(snapshot)
        })
    }

    /// Record an LLM-judge verification payload on a task.
    ///
    /// A BLOCK recommendation transitively marks every successor reachable
    /// over `blocks` edges as blocked. Returns the IDs that were blocked.
    pub fn record_verification(
        &self,
        id: &str,
        verification: Verification,
    ) -> CoreResult<Vec<String>> {
        let id = id.to_string();
        self.store.update(move |doc| {
            let task = get_task_mut(doc, &id)?;
            let recommendation = verification.recommendation;
            task.verification = Some(verification.clone());

            doc.append_event(
                "verification_recorded",
                Some(&id),
                serde_json::json!({
                    "verdict": verification.verdict,
                    "recommendation": recommendation,
                }),
            );

            let mut blocked = Vec::new();
            if recommendation == VerificationRecommendation::Block {
                let successors: Vec<String> = dag::transitive_blocks(&doc.tasks, &id)
                    .into_iter()
                    .map(String::from)
                    .collect();
                for succ_id in successors {
                    let Some(succ) = doc.tasks.get_mut(&succ_id) else {
                        continue;
                    };
                    if succ.status.is_terminal() || succ.status == TaskStatus::Running {
                        continue;
                    }
                    succ.status = TaskStatus::Blocked;
                    succ.error = Some(format!(
                        "blocked: verification of {id} recommended BLOCK"
                    ));
                    blocked.push(succ_id.clone());
                    doc.append_event(
                        "task_blocked",
                        Some(&succ_id),
                        serde_json::json!({ "blocked_by": id }),
                    );
                }
            }
            Ok(blocked)
        })
    }
}

fn get_task_mut<'d>(doc: &'d mut StateDocument, id: &str) -> Result<&'d mut Task, TaskError> {
    doc.tasks
        .get_mut(id)
        .ok_or_else(|| TaskError::NotFound(id.to_string()))
}

fn require_status(task: &Task, expected: TaskStatus, label: &str) -> Result<(), TaskError> {
    if task.status != expected {
        return Err(TaskError::InvalidTransition {
            id: task.id.clone(),
            status: task.status.as_str().to_string(),
            expected: label.to_string(),
        });
    }
    Ok(())
}
