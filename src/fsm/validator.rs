//! Structural validation of an exported behavior model.
//!
//! Enforced invariants:
//! - I1: the index designates a primary machine whose level is steel_thread.
//! - I3: completeness. The initial state is declared, at least one terminal
//!   exists, every transition references declared states, no non-terminal
//!   state is a dead end, and every state is reachable from the initial
//!   state by forward BFS.
//! - I4: every guard carries an `invariant_id`; a missing link is a
//!   warning, not an error.
//!
//! Transition coverage is computed against task-declared transition IDs:
//! steel-thread machines must meet the steel threshold (default 100%),
//! other machines the lower one (default 90%).

use serde_json::Value;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::errors::{CoreError, CoreResult};
use crate::fsm::export;
use crate::fsm::model::{Machine, MachineLevel};

/// Coverage thresholds, in percent.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    pub steel_threshold: f64,
    pub other_threshold: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            steel_threshold: 100.0,
            other_threshold: 90.0,
        }
    }
}

/// Transition coverage against the task-declared set.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CoverageReport {
    pub steel_covered: usize,
    pub steel_total: usize,
    pub steel_pct: f64,
    pub other_covered: usize,
    pub other_total: usize,
    pub other_pct: f64,
    pub missing: Vec<String>,
}

impl CoverageReport {
    pub fn meets(&self, config: &ValidatorConfig) -> bool {
        self.steel_pct >= config.steel_threshold && self.other_pct >= config.other_threshold
    }
}

/// Full validation outcome over an FSM directory.
#[derive(Debug, Default, serde::Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageReport>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check I3 and I4 over a single machine. Returns (errors, warnings).
pub fn validate_machine(machine: &Machine) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let declared: HashSet<&str> = machine.states.iter().map(|s| s.id.as_str()).collect();

    if !declared.contains(machine.initial.as_str()) {
        errors.push(format!(
            "Initial state '{}' is not declared",
            machine.initial
        ));
    }

    if machine.terminal_ids().is_empty() {
        errors.push("Machine has no terminal state".to_string());
    }

    for transition in &machine.transitions {
        for endpoint in [&transition.from, &transition.to] {
            if !declared.contains(endpoint.as_str()) {
                errors.push(format!(
                    "Transition '{}' references undeclared state '{endpoint}'",
                    transition.id
                ));
            }
        }
    }

    for state in &machine.states {
        if !state.kind.is_terminal() && machine.outgoing(&state.id).is_empty() {
            errors.push(format!(
                "Non-terminal state '{}' has no outgoing transitions",
                state.id
            ));
        }
    }

    for unreachable in unreachable_states(machine) {
        errors.push(format!("State '{unreachable}' unreachable from initial"));
    }

    for transition in &machine.transitions {
        if let Some(guard) = &transition.guard {
            if guard.invariant_id.is_none() {
                warnings.push(format!(
                    "Transition '{}' guard has no invariant_id",
                    transition.id
                ));
            }
        }
    }

    (errors, warnings)
}

/// Forward BFS from the initial state; anything not visited is unreachable.
fn unreachable_states(machine: &Machine) -> Vec<String> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    visited.insert(machine.initial.as_str());
    queue.push_back(machine.initial.as_str());

    while let Some(current) = queue.pop_front() {
        for transition in machine.transitions.iter().filter(|t| t.from == current) {
            if visited.insert(transition.to.as_str()) {
                queue.push_back(transition.to.as_str());
            }
        }
    }

    machine
        .states
        .iter()
        .filter(|s| !visited.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}

/// Validate a whole FSM directory: I1 over the index, I3/I4 per machine,
/// plus transition coverage when a declared set is provided.
pub fn validate_dir(
    dir: &Path,
    config: &ValidatorConfig,
    declared: Option<&BTreeSet<String>>,
) -> CoreResult<ValidationReport> {
    let index = export::load_index(dir)?;
    let mut report = ValidationReport::default();

    // I1 — steel-thread mandatory.
    match &index.primary_machine {
        None => report
            .errors
            .push("I1: index designates no primary machine".to_string()),
        Some(primary) => match index.machines.iter().find(|m| &m.slug == primary) {
            None => report.errors.push(format!(
                "I1: primary machine '{primary}' not found in index"
            )),
            Some(entry) if entry.level != MachineLevel::SteelThread => {
                report.errors.push(format!(
                    "I1: primary machine '{primary}' level is '{}', expected 'steel_thread'",
                    entry.level.as_str()
                ));
            }
            Some(_) => {}
        },
    }

    let mut machines = Vec::with_capacity(index.machines.len());
    for entry in &index.machines {
        let machine = export::load_machine(dir, entry)?;
        let (errors, warnings) = validate_machine(&machine);
        report.errors.extend(
            errors
                .into_iter()
                .map(|e| format!("I3 [{}]: {e}", machine.slug)),
        );
        report.warnings.extend(
            warnings
                .into_iter()
                .map(|w| format!("I4 [{}]: {w}", machine.slug)),
        );
        machines.push(machine);
    }

    if let Some(declared) = declared {
        let coverage = compute_coverage(&machines, declared);
        if coverage.steel_pct < config.steel_threshold {
            report.errors.push(format!(
                "steel-thread transition coverage {:.1}% below threshold {:.1}%",
                coverage.steel_pct, config.steel_threshold
            ));
        }
        if coverage.other_pct < config.other_threshold {
            report.errors.push(format!(
                "behavior transition coverage {:.1}% below threshold {:.1}%",
                coverage.other_pct, config.other_threshold
            ));
        }
        report.coverage = Some(coverage);
    }

    debug!(
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "validated behavior model"
    );
    Ok(report)
}

fn compute_coverage(machines: &[Machine], declared: &BTreeSet<String>) -> CoverageReport {
    let mut steel_total = 0usize;
    let mut steel_covered = 0usize;
    let mut other_total = 0usize;
    let mut other_covered = 0usize;
    let mut missing = Vec::new();

    for machine in machines {
        for transition in &machine.transitions {
            let covered = declared.contains(&transition.id);
            match machine.level {
                MachineLevel::SteelThread => {
                    steel_total += 1;
                    if covered {
                        steel_covered += 1;
                    }
                }
                MachineLevel::Behavior => {
                    other_total += 1;
                    if covered {
                        other_covered += 1;
                    }
                }
            }
            if !covered {
                missing.push(transition.id.clone());
            }
        }
    }

    let pct = |covered: usize, total: usize| {
        if total == 0 {
            100.0
        } else {
            covered as f64 / total as f64 * 100.0
        }
    };
    CoverageReport {
        steel_covered,
        steel_total,
        steel_pct: pct(steel_covered, steel_total),
        other_covered,
        other_total,
        other_pct: pct(other_covered, other_total),
        missing,
    }
}

/// Gather task-declared transition IDs from `tasks/*.json` `transitions`
/// arrays. Files without the field contribute nothing.
pub fn collect_declared_transitions(planning_dir: &Path) -> CoreResult<BTreeSet<String>> {
    let tasks_dir = planning_dir.join("tasks");
    let mut declared = BTreeSet::new();
    if !tasks_dir.exists() {
        return Ok(declared);
    }
    let entries = fs::read_dir(&tasks_dir).map_err(|source| CoreError::ReadFailed {
        path: tasks_dir.clone(),
        source,
    })?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().map(|e| e == "json") != Some(true) {
            continue;
        }
        let Ok(raw) = fs::read_to_string(&path) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        if let Some(ids) = value.get("transitions").and_then(Value::as_array) {
            for id in ids.iter().filter_map(Value::as_str) {
                declared.insert(id.to_string());
            }
        }
    }
    Ok(declared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::model::{Guard, StateDef, Transition};
    use tempfile::TempDir;

    fn transition(id: &str, from: &str, to: &str) -> Transition {
        Transition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            label: None,
            guard: None,
            is_failure_path: false,
        }
    }

    fn linear_machine() -> Machine {
        Machine {
            slug: "demo".into(),
            name: "Demo".into(),
            level: MachineLevel::SteelThread,
            initial: "s1".into(),
            states: vec![
                StateDef::normal("s1", "S1"),
                StateDef::normal("s2", "S2"),
                StateDef::success("s3", "S3"),
            ],
            transitions: vec![transition("demo-t01", "s1", "s2"), transition("demo-t02", "s2", "s3")],
        }
    }

    #[test]
    fn test_complete_machine_passes() {
        let (errors, warnings) = validate_machine(&linear_machine());
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_dead_end_and_unreachable_detected() {
        let mut machine = linear_machine();
        // Remove s2 -> s3: s2 becomes a dead end and s3 unreachable.
        machine.transitions.pop();

        let (errors, _) = validate_machine(&machine);
        assert!(errors
            .iter()
            .any(|e| e == "Non-terminal state 's2' has no outgoing transitions"));
        assert!(errors.iter().any(|e| e == "State 's3' unreachable from initial"));
    }

    #[test]
    fn test_missing_terminal_detected() {
        let machine = Machine {
            slug: "demo".into(),
            name: "Demo".into(),
            level: MachineLevel::Behavior,
            initial: "s1".into(),
            states: vec![StateDef::normal("s1", "S1"), StateDef::normal("s2", "S2")],
            transitions: vec![transition("t1", "s1", "s2"), transition("t2", "s2", "s1")],
        };
        let (errors, _) = validate_machine(&machine);
        assert!(errors.iter().any(|e| e.contains("no terminal state")));
    }

    #[test]
    fn test_undeclared_state_reference_detected() {
        let mut machine = linear_machine();
        machine.transitions.push(transition("demo-t03", "s2", "ghost"));
        let (errors, _) = validate_machine(&machine);
        assert!(errors
            .iter()
            .any(|e| e.contains("references undeclared state 'ghost'")));
    }

    #[test]
    fn test_undeclared_initial_detected() {
        let mut machine = linear_machine();
        machine.initial = "nowhere".into();
        let (errors, _) = validate_machine(&machine);
        assert!(errors.iter().any(|e| e.contains("Initial state 'nowhere'")));
    }

    #[test]
    fn test_unlinked_guard_is_warning_not_error() {
        let mut machine = linear_machine();
        machine.transitions[0].guard = Some(Guard {
            condition: "retry allowed".into(),
            invariant_id: None,
        });
        let (errors, warnings) = validate_machine(&machine);
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("no invariant_id"));
    }

    fn export_linear(dir: &Path, level: MachineLevel, primary: Option<&str>) {
        let mut machine = linear_machine();
        machine.level = level;
        export::export_machines(dir, &[machine], primary, "spec").unwrap();
    }

    #[test]
    fn test_validate_dir_i1_requires_primary() {
        let dir = TempDir::new().unwrap();
        export_linear(dir.path(), MachineLevel::SteelThread, None);

        let report = validate_dir(dir.path(), &ValidatorConfig::default(), None).unwrap();
        assert!(!report.passed());
        assert!(report.errors[0].contains("no primary machine"));
    }

    #[test]
    fn test_validate_dir_i1_requires_steel_thread_level() {
        let dir = TempDir::new().unwrap();
        export_linear(dir.path(), MachineLevel::Behavior, Some("demo"));

        let report = validate_dir(dir.path(), &ValidatorConfig::default(), None).unwrap();
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("expected 'steel_thread'")));
    }

    #[test]
    fn test_validate_dir_happy_path() {
        let dir = TempDir::new().unwrap();
        export_linear(dir.path(), MachineLevel::SteelThread, Some("demo"));

        let report = validate_dir(dir.path(), &ValidatorConfig::default(), None).unwrap();
        assert!(report.passed(), "errors: {:?}", report.errors);
    }

    #[test]
    fn test_coverage_thresholds() {
        let dir = TempDir::new().unwrap();
        export_linear(dir.path(), MachineLevel::SteelThread, Some("demo"));

        // Only one of two steel transitions declared: 50% < 100%.
        let declared: BTreeSet<String> = ["demo-t01".to_string()].into_iter().collect();
        let report =
            validate_dir(dir.path(), &ValidatorConfig::default(), Some(&declared)).unwrap();
        assert!(!report.passed());
        let coverage = report.coverage.unwrap();
        assert_eq!(coverage.steel_total, 2);
        assert_eq!(coverage.steel_covered, 1);
        assert_eq!(coverage.missing, vec!["demo-t02"]);

        // Full coverage passes.
        let declared: BTreeSet<String> =
            ["demo-t01".to_string(), "demo-t02".to_string()].into_iter().collect();
        let report =
            validate_dir(dir.path(), &ValidatorConfig::default(), Some(&declared)).unwrap();
        assert!(report.passed(), "errors: {:?}", report.errors);
        assert!(report.coverage.unwrap().meets(&ValidatorConfig::default()));
    }

    #[test]
    fn test_collect_declared_transitions() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("tasks")).unwrap();
        fs::write(
            dir.path().join("tasks/T001.json"),
            serde_json::json!({
                "id": "T001", "name": "t", "phase": 1,
                "transitions": ["demo-t01", "demo-t02"]
            })
            .to_string(),
        )
        .unwrap();
        fs::write(
            dir.path().join("tasks/T002.json"),
            serde_json::json!({"id": "T002", "name": "t", "phase": 1}).to_string(),
        )
        .unwrap();

        let declared = collect_declared_transitions(dir.path()).unwrap();
        assert_eq!(declared.len(), 2);
        assert!(declared.contains("demo-t01"));
    }
}
