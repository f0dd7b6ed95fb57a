//! Behavior-model compiler: workflow descriptions to state machines.
//!
//! Construction order is fixed: initial state, one intermediate state per
//! step (named after the step postcondition), one success terminal, one
//! failure terminal per distinct failure outcome. Transitions follow the
//! happy path first, then variant branches, then failure branches.
//!
//! A failure state may be reused across failure conditions when the
//! outcome names match; the match rule (case-insensitive substring) is a
//! convention, not a contract.

use tracing::debug;

use crate::errors::FsmError;
use crate::fsm::model::{
    slugify, BranchCase, CapabilityMapDoc, Guard, InvariantDecl, Machine, MachineLevel, StateDef,
    Transition, WorkflowDoc, WorkflowStep,
};

/// Words this short carry no signal for guard linkage.
const LINK_MIN_WORD_LEN: usize = 3;

/// Keywords that mark a policy-style invariant rule.
const POLICY_KEYWORDS: [&str; 3] = ["must", "valid", "require"];

/// Compile a spec-derived workflow into a machine.
pub fn compile_workflow(doc: &WorkflowDoc) -> Result<Machine, FsmError> {
    let level = doc.level.unwrap_or(MachineLevel::SteelThread);
    compile_steps(
        doc.slug
            .clone()
            .unwrap_or_else(|| slugify(&doc.name)),
        &doc.name,
        level,
        &doc.steps,
        &doc.invariants,
    )
}

/// Compile a capability map: the designated steel-thread capability becomes
/// the primary machine, every other indexed behavior a supporting one.
/// Returns the machines together with the primary slug.
pub fn compile_capability_map(
    doc: &CapabilityMapDoc,
) -> Result<(Vec<Machine>, Option<String>), FsmError> {
    let steel_id = doc.steel_thread.as_ref().map(|s| s.capability.as_str());
    let mut machines = Vec::new();
    let mut primary = None;

    for capability in &doc.capabilities {
        if capability.steps.is_empty() {
            continue;
        }
        let level = if steel_id == Some(capability.id.as_str()) {
            MachineLevel::SteelThread
        } else {
            MachineLevel::Behavior
        };
        let machine = compile_steps(
            slugify(&capability.name),
            &capability.name,
            level,
            &capability.steps,
            &doc.invariants,
        )?;
        if level == MachineLevel::SteelThread {
            primary = Some(machine.slug.clone());
        }
        machines.push(machine);
    }

    if machines.is_empty() {
        return Err(FsmError::CompileFailed {
            workflow: "capability map".to_string(),
            detail: "no capability carries steps".to_string(),
        });
    }
    Ok((machines, primary))
}

fn compile_steps(
    slug: String,
    name: &str,
    level: MachineLevel,
    steps: &[WorkflowStep],
    invariants: &[InvariantDecl],
) -> Result<Machine, FsmError> {
    if steps.is_empty() {
        return Err(FsmError::CompileFailed {
            workflow: name.to_string(),
            detail: "workflow has no steps".to_string(),
        });
    }

    let mut builder = MachineBuilder::new(slug, name, level);

    // States first: initial, one per step postcondition, success terminal.
    let mut step_states = Vec::with_capacity(steps.len());
    for step in steps {
        step_states.push(builder.add_state(StateDef::normal(
            &slugify(&step.postcondition),
            &step.postcondition,
        ))?);
    }
    let success = builder.add_state(StateDef::success("success", &format!("{name} complete")))?;

    // Happy path.
    let mut previous = builder.machine.initial.clone();
    for (step, state_id) in steps.iter().zip(step_states.iter()) {
        builder.add_transition(&previous, state_id, Some(step.name.as_str()), None, false);
        previous = state_id.clone();
    }
    builder.add_transition(&previous, &success, None, None, false);

    // Variant branches, from the state each step starts in.
    for (i, step) in steps.iter().enumerate() {
        let origin = origin_state(&builder, &step_states, i);
        for variant in &step.variants {
            let target = builder.resolve_variant_target(variant, &step_states[i]);
            let guard = make_guard(&variant.condition, invariants);
            builder.add_transition(&origin, &target, None, Some(guard), false);
        }
    }

    // Failure branches, deduplicated by outcome name.
    for (i, step) in steps.iter().enumerate() {
        let origin = origin_state(&builder, &step_states, i);
        for failure in &step.failures {
            let target = builder.resolve_failure_state(&failure.outcome);
            let guard = make_guard(&failure.condition, invariants);
            builder.add_transition(&origin, &target, None, Some(guard), true);
        }
    }

    debug!(
        machine = %builder.machine.slug,
        states = builder.machine.states.len(),
        transitions = builder.machine.transitions.len(),
        "compiled machine"
    );
    Ok(builder.machine)
}

fn origin_state(builder: &MachineBuilder, step_states: &[String], index: usize) -> String {
    if index == 0 {
        builder.machine.initial.clone()
    } else {
        step_states[index - 1].clone()
    }
}

fn make_guard(condition: &str, invariants: &[InvariantDecl]) -> Guard {
    Guard {
        condition: condition.to_string(),
        invariant_id: link_invariant(condition, invariants),
    }
}

/// Link a branch condition to an invariant when their wording overlaps:
/// either a multi-word overlap of words longer than three characters, or a
/// single-word overlap on a policy-keyword rule.
pub fn link_invariant(condition: &str, invariants: &[InvariantDecl]) -> Option<String> {
    let condition_words = significant_words(condition);
    for invariant in invariants {
        let rule_words = significant_words(&invariant.rule);
        let overlap = condition_words
            .iter()
            .filter(|w| rule_words.contains(*w))
            .count();
        if overlap >= 2 {
            return Some(invariant.id.clone());
        }
        let policy = POLICY_KEYWORDS
            .iter()
            .any(|kw| invariant.rule.to_lowercase().contains(kw));
        if overlap >= 1 && policy {
            return Some(invariant.id.clone());
        }
    }
    None
}

fn significant_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| w.len() > LINK_MIN_WORD_LEN)
        .map(String::from)
        .collect()
}

struct MachineBuilder {
    machine: Machine,
    next_transition: usize,
}

impl MachineBuilder {
    fn new(slug: String, name: &str, level: MachineLevel) -> Self {
        let initial = StateDef::normal("initial", "Initial");
        Self {
            machine: Machine {
                slug,
                name: name.to_string(),
                level,
                initial: initial.id.clone(),
                states: vec![initial],
                transitions: Vec::new(),
            },
            next_transition: 0,
        }
    }

    fn add_state(&mut self, state: StateDef) -> Result<String, FsmError> {
        if self.machine.states.iter().any(|s| s.id == state.id) {
            return Err(FsmError::CompileFailed {
                workflow: self.machine.name.clone(),
                detail: format!("duplicate state '{}'", state.id),
            });
        }
        let id = state.id.clone();
        self.machine.states.push(state);
        Ok(id)
    }

    fn add_transition(
        &mut self,
        from: &str,
        to: &str,
        label: Option<&str>,
        guard: Option<Guard>,
        is_failure_path: bool,
    ) {
        self.next_transition += 1;
        self.machine.transitions.push(Transition {
            id: format!("{}-t{:02}", self.machine.slug, self.next_transition),
            from: from.to_string(),
            to: to.to_string(),
            label: label.map(String::from),
            guard,
            is_failure_path,
        });
    }

    /// A variant outcome targets an existing state when the names match
    /// (case-insensitive substring); otherwise a new intermediate state is
    /// created that rejoins the step's postcondition state.
    fn resolve_variant_target(&mut self, variant: &BranchCase, rejoin: &str) -> String {
        if let Some(existing) = self.find_state_by_name(&variant.outcome) {
            return existing;
        }
        let state = StateDef::normal(&slugify(&variant.outcome), &variant.outcome);
        let id = state.id.clone();
        if self.machine.states.iter().all(|s| s.id != id) {
            self.machine.states.push(state);
            self.add_transition(&id, rejoin, None, None, false);
        }
        id
    }

    /// Failure states deduplicate by name match so one terminal can serve
    /// several failure conditions.
    fn resolve_failure_state(&mut self, outcome: &str) -> String {
        let lowered = outcome.to_lowercase();
        let existing = self
            .machine
            .states
            .iter()
            .filter(|s| s.kind == crate::fsm::model::StateType::Failure)
            .find(|s| {
                let name = s.name.to_lowercase();
                name.contains(&lowered) || lowered.contains(&name)
            })
            .map(|s| s.id.clone());
        if let Some(id) = existing {
            return id;
        }
        let state = StateDef::failure(&slugify(outcome), outcome);
        let id = state.id.clone();
        self.machine.states.push(state);
        id
    }

    fn find_state_by_name(&self, name: &str) -> Option<String> {
        let lowered = name.to_lowercase();
        self.machine
            .states
            .iter()
            .find(|s| {
                let existing = s.name.to_lowercase();
                existing.contains(&lowered) || lowered.contains(&existing)
            })
            .map(|s| s.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::model::StateType;

    fn step(name: &str, postcondition: &str) -> WorkflowStep {
        WorkflowStep {
            name: name.to_string(),
            postcondition: postcondition.to_string(),
            variants: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn branch(condition: &str, outcome: &str) -> BranchCase {
        BranchCase {
            condition: condition.to_string(),
            outcome: outcome.to_string(),
        }
    }

    fn basic_workflow() -> WorkflowDoc {
        WorkflowDoc {
            name: "Place order".into(),
            slug: None,
            level: None,
            steps: vec![
                step("validate cart", "Order validated"),
                step("capture payment", "Payment captured"),
            ],
            invariants: Vec::new(),
        }
    }

    #[test]
    fn test_happy_path_structure() {
        let machine = compile_workflow(&basic_workflow()).unwrap();

        assert_eq!(machine.slug, "place-order");
        assert_eq!(machine.initial, "initial");
        // initial + 2 steps + success
        assert_eq!(machine.states.len(), 4);
        assert_eq!(machine.terminal_ids().len(), 1);

        let path: Vec<(&str, &str)> = machine
            .transitions
            .iter()
            .map(|t| (t.from.as_str(), t.to.as_str()))
            .collect();
        assert_eq!(
            path,
            vec![
                ("initial", "order-validated"),
                ("order-validated", "payment-captured"),
                ("payment-captured", "success"),
            ]
        );
    }

    #[test]
    fn test_empty_workflow_fails() {
        let doc = WorkflowDoc {
            name: "Empty".into(),
            slug: None,
            level: None,
            steps: vec![],
            invariants: vec![],
        };
        let err = compile_workflow(&doc).unwrap_err();
        assert!(err.to_string().contains("no steps"));
    }

    #[test]
    fn test_failure_branches_marked_and_deduplicated() {
        let mut doc = basic_workflow();
        doc.steps[1].failures = vec![
            branch("card declined", "Payment rejected"),
            branch("gateway timeout", "payment rejected upstream"),
        ];

        let machine = compile_workflow(&doc).unwrap();

        let failure_states: Vec<&StateDef> = machine
            .states
            .iter()
            .filter(|s| s.kind == StateType::Failure)
            .collect();
        // Substring name match reuses the first failure terminal.
        assert_eq!(failure_states.len(), 1);
        assert_eq!(failure_states[0].name, "Payment rejected");

        let failure_transitions: Vec<&Transition> = machine
            .transitions
            .iter()
            .filter(|t| t.is_failure_path)
            .collect();
        assert_eq!(failure_transitions.len(), 2);
        // Failure during step 2 branches from step 1's postcondition state.
        for t in failure_transitions {
            assert_eq!(t.from, "order-validated");
            assert!(t.guard.is_some());
        }
    }

    #[test]
    fn test_variant_branch_with_rejoin() {
        let mut doc = basic_workflow();
        doc.steps[0].variants = vec![branch("customer is returning", "Saved cart restored")];

        let machine = compile_workflow(&doc).unwrap();

        // The unresolved variant outcome created a new state that rejoins
        // the step's postcondition.
        let variant_state = machine.get_state("saved-cart-restored").unwrap();
        assert_eq!(variant_state.kind, StateType::Normal);
        assert!(machine
            .transitions
            .iter()
            .any(|t| t.from == "saved-cart-restored" && t.to == "order-validated"));
        // The branch itself leaves the initial state with a guard.
        let branch_t = machine
            .transitions
            .iter()
            .find(|t| t.to == "saved-cart-restored" && t.from == "initial")
            .unwrap();
        assert_eq!(
            branch_t.guard.as_ref().unwrap().condition,
            "customer is returning"
        );
        assert!(!branch_t.is_failure_path);
    }

    #[test]
    fn test_variant_targeting_existing_state() {
        let mut doc = basic_workflow();
        // Outcome matches an existing postcondition by substring.
        doc.steps[0].variants = vec![branch("express checkout", "payment captured")];

        let machine = compile_workflow(&doc).unwrap();
        let branch_t = machine
            .transitions
            .iter()
            .find(|t| t.guard.is_some())
            .unwrap();
        assert_eq!(branch_t.to, "payment-captured");
    }

    #[test]
    fn test_guard_linked_by_word_overlap() {
        let invariants = vec![
            InvariantDecl {
                id: "INV-1".into(),
                rule: "shipping address is confirmed before dispatch".into(),
            },
            InvariantDecl {
                id: "INV-2".into(),
                rule: "payment captured before shipping".into(),
            },
        ];
        // Two >3-char words overlap with INV-2: "payment", "captured"
        let linked = link_invariant("payment is not captured", &invariants);
        assert_eq!(linked.as_deref(), Some("INV-2"));
    }

    #[test]
    fn test_guard_linked_by_policy_keyword() {
        let invariants = vec![InvariantDecl {
            id: "INV-3".into(),
            rule: "every order must carry a shipping address".into(),
        }];
        // Single overlapping word ("shipping") but the rule is policy-like.
        let linked = link_invariant("shipping unavailable", &invariants);
        assert_eq!(linked.as_deref(), Some("INV-3"));
    }

    #[test]
    fn test_guard_unlinked_keeps_bare_condition() {
        let mut doc = basic_workflow();
        doc.steps[0].failures = vec![branch("cosmic rays", "Hardware fault")];
        doc.invariants = vec![InvariantDecl {
            id: "INV-1".into(),
            rule: "payment captured before shipping".into(),
        }];

        let machine = compile_workflow(&doc).unwrap();
        let guard = machine
            .transitions
            .iter()
            .find_map(|t| t.guard.as_ref())
            .unwrap();
        assert_eq!(guard.condition, "cosmic rays");
        assert!(guard.invariant_id.is_none());
    }

    #[test]
    fn test_capability_map_designates_primary() {
        let doc = CapabilityMapDoc {
            capabilities: vec![
                crate::fsm::model::Capability {
                    id: "C1".into(),
                    name: "Checkout".into(),
                    steps: vec![step("pay", "Payment done")],
                },
                crate::fsm::model::Capability {
                    id: "C2".into(),
                    name: "Refund".into(),
                    steps: vec![step("refund", "Refund issued")],
                },
                crate::fsm::model::Capability {
                    id: "C3".into(),
                    name: "No steps".into(),
                    steps: vec![],
                },
            ],
            steel_thread: Some(crate::fsm::model::SteelThreadRef {
                capability: "C1".into(),
            }),
            invariants: vec![],
        };

        let (machines, primary) = compile_capability_map(&doc).unwrap();
        assert_eq!(machines.len(), 2, "capability without steps is skipped");
        assert_eq!(primary.as_deref(), Some("checkout"));
        assert_eq!(machines[0].level, MachineLevel::SteelThread);
        assert_eq!(machines[1].level, MachineLevel::Behavior);
    }

    #[test]
    fn test_transition_ids_are_stable_and_prefixed() {
        let machine = compile_workflow(&basic_workflow()).unwrap();
        let ids: Vec<&str> = machine.transitions.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["place-order-t01", "place-order-t02", "place-order-t03"]);
    }
}
