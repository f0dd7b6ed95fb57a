//! Behavior-model types: machines, states, transitions, guards.
//!
//! A machine is the compiled form of a workflow: an initial state, one
//! intermediate state per step, a success terminal, and failure terminals.
//! Guards carry the branch condition and, when linkage succeeds, the ID of
//! the invariant the transition enforces.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Classification of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    #[default]
    Normal,
    Success,
    Failure,
}

impl StateType {
    /// Terminals are success or failure states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// Importance level of a machine within the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MachineLevel {
    /// The designated primary end-to-end workflow
    SteelThread,
    /// A supporting behavior
    #[default]
    Behavior,
}

impl MachineLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineLevel::SteelThread => "steel_thread",
            MachineLevel::Behavior => "behavior",
        }
    }
}

/// A single state of a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDef {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: StateType,
}

impl StateDef {
    pub fn normal(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind: StateType::Normal,
        }
    }

    pub fn success(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind: StateType::Success,
        }
    }

    pub fn failure(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind: StateType::Failure,
        }
    }
}

/// Boolean condition on a transition, optionally linked to an invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guard {
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invariant_id: Option<String>,
}

/// A directed transition between two declared states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
    #[serde(default)]
    pub is_failure_path: bool,
}

/// A compiled state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub slug: String,
    pub name: String,
    pub level: MachineLevel,
    pub initial: String,
    pub states: Vec<StateDef>,
    pub transitions: Vec<Transition>,
}

impl Machine {
    /// IDs of terminal states.
    pub fn terminal_ids(&self) -> BTreeSet<&str> {
        self.states
            .iter()
            .filter(|s| s.kind.is_terminal())
            .map(|s| s.id.as_str())
            .collect()
    }

    /// Look up a state by ID.
    pub fn get_state(&self, id: &str) -> Option<&StateDef> {
        self.states.iter().find(|s| s.id == id)
    }

    /// Transitions leaving the given state.
    pub fn outgoing(&self, state_id: &str) -> Vec<&Transition> {
        self.transitions
            .iter()
            .filter(|t| t.from == state_id)
            .collect()
    }
}

/// One ordered step of a workflow description.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    /// Names the intermediate state the step produces
    pub postcondition: String,
    #[serde(default)]
    pub variants: Vec<BranchCase>,
    #[serde(default)]
    pub failures: Vec<BranchCase>,
}

/// A variant or failure branch: a condition and the outcome it leads to.
#[derive(Debug, Clone, Deserialize)]
pub struct BranchCase {
    pub condition: String,
    pub outcome: String,
}

/// An invariant candidate for guard linkage.
#[derive(Debug, Clone, Deserialize)]
pub struct InvariantDecl {
    pub id: String,
    pub rule: String,
}

/// Spec-derived workflow description, the compiler's primary input.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDoc {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub level: Option<MachineLevel>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub invariants: Vec<InvariantDecl>,
}

/// Capability-map input: indexed behaviors plus a designated steel thread.
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityMapDoc {
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub steel_thread: Option<SteelThreadRef>,
    #[serde(default)]
    pub invariants: Vec<InvariantDecl>,
}

/// One indexed behavior of a capability map.
#[derive(Debug, Clone, Deserialize)]
pub struct Capability {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

/// Designation of the primary end-to-end flow.
#[derive(Debug, Clone, Deserialize)]
pub struct SteelThreadRef {
    pub capability: String,
}

/// Derive a filesystem-safe slug from a human-readable name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Order Placed"), "order-placed");
        assert_eq!(slugify("  spaced   out  "), "spaced-out");
        assert_eq!(slugify("Already-Slugged"), "already-slugged");
        assert_eq!(slugify("punct!u@ation"), "punct-u-ation");
    }

    #[test]
    fn test_terminal_classification() {
        assert!(!StateType::Normal.is_terminal());
        assert!(StateType::Success.is_terminal());
        assert!(StateType::Failure.is_terminal());
    }

    #[test]
    fn test_machine_lookups() {
        let machine = Machine {
            slug: "demo".into(),
            name: "Demo".into(),
            level: MachineLevel::SteelThread,
            initial: "initial".into(),
            states: vec![
                StateDef::normal("initial", "Initial"),
                StateDef::normal("step-done", "Step done"),
                StateDef::success("success", "Success"),
            ],
            transitions: vec![
                Transition {
                    id: "demo-t01".into(),
                    from: "initial".into(),
                    to: "step-done".into(),
                    label: None,
                    guard: None,
                    is_failure_path: false,
                },
                Transition {
                    id: "demo-t02".into(),
                    from: "step-done".into(),
                    to: "success".into(),
                    label: None,
                    guard: None,
                    is_failure_path: false,
                },
            ],
        };

        assert_eq!(machine.terminal_ids().len(), 1);
        assert!(machine.get_state("step-done").is_some());
        assert_eq!(machine.outgoing("initial").len(), 1);
        assert!(machine.outgoing("success").is_empty());
    }

    #[test]
    fn test_guard_serde_omits_missing_link() {
        let guard = Guard {
            condition: "payment method is invalid".into(),
            invariant_id: None,
        };
        let json = serde_json::to_string(&guard).unwrap();
        assert!(!json.contains("invariant_id"));
    }

    #[test]
    fn test_workflow_doc_parses_minimal_shape() {
        let json = serde_json::json!({
            "name": "Place order",
            "steps": [
                {"name": "validate", "postcondition": "Order validated"},
                {
                    "name": "charge",
                    "postcondition": "Payment captured",
                    "failures": [
                        {"condition": "card declined", "outcome": "Payment rejected"}
                    ]
                }
            ],
            "invariants": [
                {"id": "INV-1", "rule": "payment must be captured before shipping"}
            ]
        });
        let doc: WorkflowDoc = serde_json::from_value(json).unwrap();
        assert_eq!(doc.steps.len(), 2);
        assert_eq!(doc.steps[1].failures.len(), 1);
        assert_eq!(doc.invariants[0].id, "INV-1");
    }
}
