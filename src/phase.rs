//! Planning-pipeline phases and the controller that gates transitions.
//!
//! Phases form a closed, ordered set. `PhaseController::advance` only ever
//! moves `phase.current` to the immediately-next phase in `PHASE_ORDER`,
//! and each transition has a precondition checked before any mutation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::PhaseError;

/// A named stage of the planning/execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    /// Raw specification has been placed under `inputs/`
    Ingestion,
    /// Spec weaknesses are being reviewed
    SpecReview,
    /// Capability map extraction
    Logical,
    /// File-level mapping of capabilities
    Physical,
    /// Per-task definition files are written
    Definition,
    /// LLM-judge validation of the task set
    Validation,
    /// Dependency ordering and cycle checks
    Sequencing,
    /// Planning finished, execution not yet started
    Ready,
    /// Tasks are being executed
    Executing,
    /// Every task is complete or skipped
    Complete,
}

/// Canonical phase order. `advance` only ever moves one step along this list.
pub const PHASE_ORDER: [PhaseName; 10] = [
    PhaseName::Ingestion,
    PhaseName::SpecReview,
    PhaseName::Logical,
    PhaseName::Physical,
    PhaseName::Definition,
    PhaseName::Validation,
    PhaseName::Sequencing,
    PhaseName::Ready,
    PhaseName::Executing,
    PhaseName::Complete,
];

impl PhaseName {
    /// Snake-case wire form, matching the JSON contract.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Ingestion => "ingestion",
            PhaseName::SpecReview => "spec_review",
            PhaseName::Logical => "logical",
            PhaseName::Physical => "physical",
            PhaseName::Definition => "definition",
            PhaseName::Validation => "validation",
            PhaseName::Sequencing => "sequencing",
            PhaseName::Ready => "ready",
            PhaseName::Executing => "executing",
            PhaseName::Complete => "complete",
        }
    }

    /// Position in the canonical order.
    pub fn index(&self) -> usize {
        PHASE_ORDER.iter().position(|p| p == self).unwrap_or(0)
    }

    /// The immediately-next phase, or `None` from `complete`.
    pub fn next(&self) -> Option<PhaseName> {
        PHASE_ORDER.get(self.index() + 1).copied()
    }

    /// Check if this is the terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseName::Complete)
    }

    /// Check if execution has started (ready set is meaningful).
    pub fn is_execution(&self) -> bool {
        matches!(self, PhaseName::Ready | PhaseName::Executing | PhaseName::Complete)
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseName {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PHASE_ORDER
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| PhaseError::UnknownPhase(s.to_string()))
    }
}

/// The phase controller: gates `advance` behind per-transition preconditions.
pub struct PhaseController<'a> {
    store: &'a crate::state::store::StateStore,
}

impl<'a> PhaseController<'a> {
    pub fn new(store: &'a crate::state::store::StateStore) -> Self {
        Self { store }
    }

    /// Advance to the immediately-next phase if its precondition holds.
    ///
    /// On success appends the previous phase to `phase.completed`, sets
    /// `phase.current`, and emits a `phase_advanced` event. On failure the
    /// unmet precondition is surfaced verbatim and nothing is mutated.
    pub fn advance(&self) -> crate::errors::CoreResult<(PhaseName, PhaseName)> {
        let dir = self.store.dir().to_path_buf();
        self.store.update(move |doc| {
            let current = doc.phase.current;
            let next = current.next().ok_or(PhaseError::AlreadyComplete)?;
            check_precondition(&dir, doc, current, next)?;

            doc.phase.completed.push(current);
            doc.phase.current = next;
            doc.append_event(
                "phase_advanced",
                None,
                serde_json::json!({ "from": current, "to": next }),
            );
            tracing::info!(from = %current, to = %next, "phase advanced");
            Ok((current, next))
        })
    }
}

/// Check the precondition for a single transition of the canonical order.
fn check_precondition(
    dir: &std::path::Path,
    doc: &crate::state::document::StateDocument,
    from: PhaseName,
    to: PhaseName,
) -> Result<(), PhaseError> {
    let fail = |reason: String| PhaseError::PreconditionFailed {
        from: from.as_str().to_string(),
        to: to.as_str().to_string(),
        reason,
    };

    match from {
        PhaseName::Ingestion => {
            let spec = dir.join("inputs").join("spec.md");
            if !spec.exists() {
                return Err(fail(format!("{} does not exist", spec.display())));
            }
        }
        // Informational gate: unresolved weaknesses are recorded upstream
        // but do not block the transition.
        PhaseName::SpecReview => {}
        PhaseName::Logical => {
            if !doc
                .artifacts
                .capability_map
                .as_ref()
                .is_some_and(|a| a.valid)
            {
                return Err(fail("artifacts.capability_map is not valid".into()));
            }
        }
        PhaseName::Physical => {
            if !doc
                .artifacts
                .physical_map
                .as_ref()
                .is_some_and(|a| a.valid)
            {
                return Err(fail("artifacts.physical_map is not valid".into()));
            }
        }
        PhaseName::Definition => {
            let definitions = crate::tasks::loader::read_task_definitions(dir)
                .map_err(|e| fail(format!("task files do not load cleanly: {e}")))?;
            if definitions.is_empty() {
                return Err(fail("no task files under tasks/".into()));
            }
            for def in &definitions {
                if !doc.tasks.contains_key(&def.id) {
                    return Err(fail(format!(
                        "task {} is defined on disk but not loaded; run load-tasks",
                        def.id
                    )));
                }
            }
            let gates = doc.artifacts.validation_results.as_ref();
            match gates {
                Some(results) if results.all_passed() => {}
                Some(results) => {
                    return Err(fail(format!(
                        "planning gates failed: {}",
                        results.failed_gates().join(", ")
                    )));
                }
                None => return Err(fail("planning gates have not been recorded".into())),
            }
        }
        PhaseName::Validation => {
            let permits = doc
                .artifacts
                .task_validation
                .as_ref()
                .is_some_and(|v| v.permits_sequencing());
            if !permits {
                return Err(fail(
                    "task_validation.verdict is not READY or READY_WITH_NOTES".into(),
                ));
            }
        }
        PhaseName::Sequencing => {
            if let Err(e) = crate::tasks::dag::detect_cycles(&doc.tasks) {
                return Err(fail(e.to_string()));
            }
            let violations = crate::tasks::dag::sequencing_violations(&doc.tasks);
            if !violations.is_empty() {
                let rendered: Vec<String> =
                    violations.iter().map(|v| v.to_string()).collect();
                return Err(fail(format!(
                    "phase ordering violated: {}",
                    rendered.join("; ")
                )));
            }
        }
        // Explicit advance out of `ready` mirrors the implicit transition
        // taken by the first start-task.
        PhaseName::Ready => {}
        PhaseName::Executing => {
            if !doc.all_tasks_done() {
                let open: Vec<&str> = doc
                    .tasks
                    .values()
                    .filter(|t| !t.status.satisfies_dependency())
                    .map(|t| t.id.as_str())
                    .collect();
                return Err(fail(format!(
                    "{} task(s) not complete or skipped: {}",
                    open.len(),
                    open.join(", ")
                )));
            }
        }
        PhaseName::Complete => unreachable!("complete has no next phase"),
    }
    Ok(())
}
