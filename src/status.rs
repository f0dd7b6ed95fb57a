//! Derived status summary for the `status` command.
//!
//! The summary is computed from a single load of the state document; no
//! field here is authoritative. Skipped tasks count as completed in the
//! progress ratio, matching the counter invariant.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::state::document::{StateDocument, TaskStatus};
use crate::tasks::dag;

/// How many trailing audit events the text rendering shows.
const RECENT_EVENTS: usize = 5;

/// Snapshot of pipeline progress, serializable as the `status --json` output.
#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub phase: String,
    pub phases_completed: Vec<String>,
    pub target_dir: String,
    pub counts: BTreeMap<String, usize>,
    pub active_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
    pub ready_tasks: Vec<ReadyTask>,
    pub completed: u64,
    pub total: usize,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub halted: bool,
}

/// One entry of the canonical offer-order.
#[derive(Debug, Serialize)]
pub struct ReadyTask {
    pub id: String,
    pub name: String,
    pub phase: u32,
}

impl StatusSummary {
    /// Derive the summary from a loaded document.
    pub fn from_document(doc: &StateDocument) -> Self {
        let counts: BTreeMap<String, usize> = doc
            .status_counts()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let mut failed_tasks: Vec<String> = doc
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id.clone())
            .collect();
        failed_tasks.sort();

        let ready_tasks: Vec<ReadyTask> = dag::ready_tasks(doc)
            .into_iter()
            .map(|t| ReadyTask {
                id: t.id.clone(),
                name: t.name.clone(),
                phase: t.phase,
            })
            .collect();

        let completed = doc
            .tasks
            .values()
            .filter(|t| t.status.satisfies_dependency())
            .count() as u64;

        Self {
            phase: doc.phase.current.to_string(),
            phases_completed: doc.phase.completed.iter().map(|p| p.to_string()).collect(),
            target_dir: doc.target_dir.clone(),
            counts,
            active_tasks: doc.execution.active_tasks.iter().cloned().collect(),
            failed_tasks,
            ready_tasks,
            completed,
            total: doc.tasks.len(),
            total_tokens: doc.execution.total_tokens,
            total_cost_usd: doc.execution.total_cost_usd,
            halted: doc.halt.as_ref().is_some_and(|h| h.requested),
        }
    }

    /// Human-readable rendering for the default `status` output.
    pub fn render_text(&self, doc: &StateDocument) -> String {
        let mut out = String::new();
        out.push_str(&format!("Phase:    {}\n", self.phase));
        out.push_str(&format!("Target:   {}\n", self.target_dir));
        out.push_str(&format!(
            "Progress: {}/{} tasks complete\n",
            self.completed, self.total
        ));

        let interesting: Vec<String> = self
            .counts
            .iter()
            .filter(|(_, v)| **v > 0)
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if !interesting.is_empty() {
            out.push_str(&format!("Tasks:    {}\n", interesting.join(" ")));
        }
        if !self.active_tasks.is_empty() {
            out.push_str(&format!("Active:   {}\n", self.active_tasks.join(", ")));
        }
        if !self.failed_tasks.is_empty() {
            out.push_str(&format!("Failed:   {}\n", self.failed_tasks.join(", ")));
        }
        if !self.ready_tasks.is_empty() {
            let ids: Vec<&str> = self.ready_tasks.iter().map(|t| t.id.as_str()).collect();
            out.push_str(&format!("Ready:    {}\n", ids.join(", ")));
        }
        if self.total_tokens > 0 {
            out.push_str(&format!(
                "Usage:    {} tokens (${:.4})\n",
                self.total_tokens, self.total_cost_usd
            ));
        }
        if self.halted {
            out.push_str("Halted:   yes\n");
        }

        let recent: Vec<&crate::state::document::Event> =
            doc.events.iter().rev().take(RECENT_EVENTS).collect();
        if !recent.is_empty() {
            out.push_str("Recent events:\n");
            for event in recent.into_iter().rev() {
                match &event.task_id {
                    Some(id) => out.push_str(&format!(
                        "  {} {} {}\n",
                        event.timestamp.format("%H:%M:%S"),
                        event.kind,
                        id
                    )),
                    None => out.push_str(&format!(
                        "  {} {}\n",
                        event.timestamp.format("%H:%M:%S"),
                        event.kind
                    )),
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::document::Task;
    use std::collections::BTreeSet;

    fn task(id: &str, phase: u32, deps: &[&str], status: TaskStatus) -> Task {
        let mut t = Task::new(
            id,
            &format!("Task {id}"),
            phase,
            deps.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            BTreeSet::new(),
            &format!("{id}.json"),
        );
        t.status = status;
        t
    }

    fn sample_doc() -> StateDocument {
        let mut doc = StateDocument::new("/repo");
        for t in [
            task("T001", 1, &[], TaskStatus::Complete),
            task("T002", 1, &["T001"], TaskStatus::Pending),
            task("T003", 1, &[], TaskStatus::Skipped),
            task("T004", 2, &[], TaskStatus::Failed),
            task("T005", 2, &[], TaskStatus::Running),
        ] {
            doc.tasks.insert(t.id.clone(), t);
        }
        doc.recompute_counters();
        doc
    }

    #[test]
    fn test_summary_counts_and_sets() {
        let doc = sample_doc();
        let summary = StatusSummary::from_document(&doc);

        assert_eq!(summary.total, 5);
        // Skipped counts as completed
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.counts["failed"], 1);
        assert_eq!(summary.failed_tasks, vec!["T004"]);
        assert_eq!(summary.active_tasks, vec!["T005"]);
        let ready: Vec<&str> = summary.ready_tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["T002"]);
    }

    #[test]
    fn test_summary_serializes_to_json() {
        let doc = sample_doc();
        let summary = StatusSummary::from_document(&doc);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["phase"], "ingestion");
        assert_eq!(json["completed"], 2);
        assert_eq!(json["total"], 5);
    }

    #[test]
    fn test_text_rendering_mentions_progress() {
        let mut doc = sample_doc();
        doc.append_event("task_started", Some("T005"), serde_json::Value::Null);
        let summary = StatusSummary::from_document(&doc);
        let text = summary.render_text(&doc);
        assert!(text.contains("Progress: 2/5"));
        assert!(text.contains("Failed:   T004"));
        assert!(text.contains("task_started T005"));
    }

    #[test]
    fn test_halted_flag() {
        let mut doc = sample_doc();
        doc.halt = Some(crate::state::document::HaltState {
            requested: true,
            reason: "operator".into(),
            requested_at: chrono::Utc::now(),
            requested_by: "cli".into(),
            halted_at: None,
            active_task: None,
        });
        let summary = StatusSummary::from_document(&doc);
        assert!(summary.halted);
    }
}
