#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use agent_audit_domain::{
    now_rfc3339, AgentTrace, StateTransition, TraceEvent, WorkflowDocument,
};

pub const DEFAULT_WORKFLOW_VERSION: &str = "v0.1";

/// Label assigned to the edge leaving the final trace event.
pub const TERMINAL_STATE: &str = "terminal";

/// Insertion-ordered string set. Iteration order is the order in which
/// labels were first added, independent of any hash/sort behavior.
#[derive(Debug, Default)]
struct OrderedStateSet {
    seen: BTreeSet<String>,
    ordered: Vec<String>,
}

impl OrderedStateSet {
    fn insert(&mut self, label: &str) {
        if self.seen.insert(label.to_string()) {
            self.ordered.push(label.to_string());
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.ordered
    }
}

fn state_label(event: &TraceEvent, index: usize) -> String {
    if event.state.is_empty() {
        format!("state_{index}")
    } else {
        event.state.clone()
    }
}

/// Compile a trace into a workflow document tagged with the default version.
#[must_use]
pub fn compile_trace(trace: &AgentTrace) -> WorkflowDocument {
    compile_trace_with_version(trace, DEFAULT_WORKFLOW_VERSION)
}

/// Compile a trace into a finite-state workflow document.
///
/// Each event contributes one transition; the source state is the event's
/// own label (synthesized as `state_<i>` when empty) and the target is the
/// next event's label, or [`TERMINAL_STATE`] for the last event. State
/// identity is purely syntactic; no merging of equivalent states happens.
/// An empty trace yields an empty but valid document. Compilation cannot
/// fail; non-contiguous indices are a caller contract violation and are not
/// detected here.
#[must_use]
pub fn compile_trace_with_version(trace: &AgentTrace, version: &str) -> WorkflowDocument {
    let mut states = OrderedStateSet::default();
    let mut transitions = Vec::with_capacity(trace.events.len());

    for (index, event) in trace.events.iter().enumerate() {
        let current_state = state_label(event, index);
        let next_state = trace
            .events
            .get(index + 1)
            .map_or_else(|| TERMINAL_STATE.to_string(), |next| state_label(next, index + 1));

        states.insert(&current_state);
        states.insert(&next_state);

        transitions.push(StateTransition {
            state: current_state,
            action: event.action.clone(),
            selector: event.selector.clone(),
            next_state,
        });
    }

    WorkflowDocument {
        run_id: trace.run_id,
        workflow: trace.workflow.clone(),
        version: version.to_string(),
        states: states.into_vec(),
        transitions,
        created_at: now_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use agent_audit_domain::{AgentTrace, RunId, TraceEvent};

    use super::{compile_trace, compile_trace_with_version, TERMINAL_STATE};

    fn event(index: usize, state: &str, action: &str) -> TraceEvent {
        TraceEvent {
            index,
            state: state.to_string(),
            action: action.to_string(),
            selector: format!("#{action}"),
            score_delta: None,
        }
    }

    fn trace(events: Vec<TraceEvent>) -> AgentTrace {
        AgentTrace {
            run_id: RunId::new(),
            workflow: "checkout".to_string(),
            events,
        }
    }

    #[test]
    fn one_transition_per_event_with_chained_next_states() {
        let trace = trace(vec![
            event(0, "login", "type"),
            event(1, "dashboard", "click"),
            event(2, "transfer", "submit"),
        ]);

        let document = compile_trace(&trace);

        assert_eq!(document.transitions.len(), trace.events.len());
        for pair in document.transitions.windows(2) {
            assert_eq!(pair[0].next_state, pair[1].state);
        }
        let last = document.transitions.last();
        assert!(last.is_some());
        let last = last.unwrap_or_else(|| unreachable!());
        assert_eq!(last.next_state, TERMINAL_STATE);
    }

    #[test]
    fn empty_states_get_synthesized_labels_on_both_edge_ends() {
        let trace = trace(vec![
            event(0, "", "click"),
            event(1, "", "type"),
        ]);

        let document = compile_trace(&trace);

        assert_eq!(document.transitions[0].state, "state_0");
        assert_eq!(document.transitions[0].next_state, "state_1");
        assert_eq!(document.transitions[1].state, "state_1");
        assert_eq!(document.transitions[1].next_state, TERMINAL_STATE);
    }

    #[test]
    fn states_are_deduplicated_in_first_insertion_order() {
        let trace = trace(vec![
            event(0, "login", "type"),
            event(1, "dashboard", "click"),
            event(2, "login", "back"),
        ]);

        let document = compile_trace(&trace);

        assert_eq!(
            document.states,
            vec!["login", "dashboard", TERMINAL_STATE]
        );
        for transition in &document.transitions {
            assert!(document.states.contains(&transition.state));
            assert!(document.states.contains(&transition.next_state));
        }
    }

    #[test]
    fn empty_trace_compiles_to_trivial_document() {
        let trace = trace(Vec::new());

        let document = compile_trace_with_version(&trace, "v9");

        assert!(document.states.is_empty());
        assert!(document.transitions.is_empty());
        assert_eq!(document.version, "v9");
    }
}
