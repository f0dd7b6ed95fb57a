//! Dependency-DAG analysis over the task map.
//!
//! The DAG is implicit in each task's `depends_on`; nothing here is
//! persisted. Cycle detection runs Kahn's algorithm, the ready set is the
//! canonical offer-order to the scheduler, and the sequencing check
//! enforces that every dependency sits in an equal-or-earlier phase.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::errors::TaskError;
use crate::state::document::{StateDocument, Task};

/// A sequencing violation: a task whose dependency breaks phase ordering
/// or does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencingViolation {
    pub task: String,
    pub dependency: String,
    pub reason: String,
}

impl std::fmt::Display for SequencingViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}: {}", self.task, self.dependency, self.reason)
    }
}

/// Topological sort via Kahn's algorithm; a back-edge means a cycle.
///
/// Edges are only counted between tasks that exist in the map; a missing
/// dependency is a sequencing violation, not a cycle.
pub fn detect_cycles(tasks: &BTreeMap<String, Task>) -> Result<(), TaskError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (id, task) in tasks {
        in_degree.entry(id).or_insert(0);
        for dep in &task.depends_on {
            if tasks.contains_key(dep) {
                *in_degree.entry(id).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(id);
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut processed = 0;
    while let Some(id) = queue.pop_front() {
        processed += 1;
        if let Some(deps) = dependents.get(id) {
            for &dependent in deps {
                let deg = in_degree.get_mut(dependent).map(|d| {
                    *d -= 1;
                    *d
                });
                if deg == Some(0) {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if processed != tasks.len() {
        let mut ids: Vec<String> = in_degree
            .iter()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(&id, _)| id.to_string())
            .collect();
        ids.sort();
        return Err(TaskError::CycleDetected { ids });
    }
    Ok(())
}

/// Compute the ready set: pending tasks whose every dependency exists and
/// has status `complete` or `skipped`, sorted by phase ascending then ID
/// lexicographically. This is the canonical offer-order to the scheduler.
pub fn ready_tasks(doc: &StateDocument) -> Vec<&Task> {
    let mut ready: Vec<&Task> = doc
        .tasks
        .values()
        .filter(|task| {
            task.status == crate::state::document::TaskStatus::Pending
                && task.depends_on.iter().all(|dep| {
                    doc.tasks
                        .get(dep)
                        .is_some_and(|d| d.status.satisfies_dependency())
                })
        })
        .collect();
    ready.sort_by(|a, b| a.phase.cmp(&b.phase).then_with(|| a.id.cmp(&b.id)));
    ready
}

/// Check phase assignment: for every task T with dependency D,
/// `T.phase >= D.phase` must hold, and D must exist.
pub fn sequencing_violations(tasks: &BTreeMap<String, Task>) -> Vec<SequencingViolation> {
    let mut violations = Vec::new();
    for (id, task) in tasks {
        for dep in &task.depends_on {
            match tasks.get(dep) {
                None => violations.push(SequencingViolation {
                    task: id.clone(),
                    dependency: dep.clone(),
                    reason: "dependency does not exist".to_string(),
                }),
                Some(d) if d.phase > task.phase => violations.push(SequencingViolation {
                    task: id.clone(),
                    dependency: dep.clone(),
                    reason: format!(
                        "dependency in later phase ({} > {})",
                        d.phase, task.phase
                    ),
                }),
                Some(_) => {}
            }
        }
    }
    violations
}

/// All IDs reachable downstream of `id` over `blocks` edges.
///
/// Used when a BLOCK verification recommendation propagates to successors.
pub fn transitive_blocks<'a>(tasks: &'a BTreeMap<String, Task>, id: &str) -> Vec<&'a str> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    if let Some(task) = tasks.get(id) {
        for next in &task.blocks {
            queue.push_back(next);
        }
    }
    while let Some(next) = queue.pop_front() {
        if !seen.insert(next) {
            continue;
        }
        if let Some(task) = tasks.get(next) {
            for follow in &task.blocks {
                queue.push_back(follow);
            }
        }
    }
    let mut out: Vec<&str> = seen.into_iter().collect();
    out.sort();
    out
}
