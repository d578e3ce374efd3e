//! Validates a transition-function shape at `AbciAppBuilder::build` time,
//! the way the original framework's `_MetaAbciApp` metaclass validated a
//! subclass's attributes at class-creation time (spec.md §4.K). Since
//! Rust has no metaclasses, the same checks run as a plain function the
//! builder calls before handing out an immutable [`crate::app::AbciAppDescriptor`].

use std::collections::{HashMap, HashSet};

use round_abci_types::EngineError;

use crate::round::EventName;
use crate::round::RoundId;

/// Run every static check from spec.md §4.K against a not-yet-built
/// transition table. Returns the first violation found, as an
/// [`EngineError::Internal`].
#[allow(clippy::too_many_arguments)]
pub fn check(
    initial_round_cls: Option<RoundId>,
    initial_states: &HashSet<RoundId>,
    final_states: &HashSet<RoundId>,
    transition_function: &HashMap<RoundId, HashMap<EventName, RoundId>>,
    event_to_timeout: &HashMap<EventName, f64>,
    degenerate_rounds: &HashSet<RoundId>,
) -> Result<(), EngineError> {
    let initial_round_cls = initial_round_cls
        .ok_or_else(|| EngineError::Internal("'initial_round_cls' field not set".into()))?;
    if transition_function.is_empty() {
        return Err(EngineError::Internal("'transition_function' field not set".into()));
    }

    let states: HashSet<RoundId> = transition_function
        .iter()
        .flat_map(|(from, transitions)| std::iter::once(*from).chain(transitions.values().copied()))
        .collect();

    if !initial_states.is_empty() && !initial_states.contains(&initial_round_cls) {
        return Err(EngineError::Internal(format!(
            "initial round class '{initial_round_cls}' is not in the set of initial states"
        )));
    }
    if !states.contains(&initial_round_cls) {
        return Err(EngineError::Internal(format!(
            "initial round class '{initial_round_cls}' must be in the set of states"
        )));
    }
    for state in initial_states {
        if !states.contains(state) {
            return Err(EngineError::Internal(format!(
                "initial state '{state}' must be in the set of states"
            )));
        }
    }

    let true_initial_states: HashSet<RoundId> =
        if initial_states.is_empty() { HashSet::from([initial_round_cls]) } else { initial_states.clone() };
    for state in &true_initial_states {
        if final_states.contains(state) {
            return Err(EngineError::Internal(format!("initial state '{state}' cannot be a final state")));
        }
    }

    for state in final_states {
        if !states.contains(state) {
            return Err(EngineError::Internal(format!(
                "final state '{state}' is not in the set of states"
            )));
        }
    }
    for state in final_states {
        let has_outgoing = transition_function.get(state).map(|t| !t.is_empty()).unwrap_or(false);
        if has_outgoing {
            return Err(EngineError::Internal(format!("final state '{state}' cannot have outgoing transitions")));
        }
    }
    for state in final_states {
        if !degenerate_rounds.contains(state) {
            return Err(EngineError::Internal(format!(
                "final round class '{state}' must be a degenerate (sink) round"
            )));
        }
    }

    let timeout_events: HashSet<EventName> = event_to_timeout.keys().copied().collect();
    for state in &states {
        if final_states.contains(state) {
            continue;
        }
        let empty = HashMap::new();
        let outgoing = transition_function.get(state).unwrap_or(&empty);
        let outgoing_events: HashSet<EventName> = outgoing.keys().copied().collect();
        let timeout_count = outgoing_events.intersection(&timeout_events).count();
        let nontimeout_count = outgoing_events.difference(&timeout_events).count();
        if timeout_count >= 2 {
            return Err(EngineError::Internal(format!(
                "non-final state '{state}' cannot have more than one outgoing timeout event"
            )));
        }
        if nontimeout_count == 0 {
            return Err(EngineError::Internal(format!(
                "non-final state '{state}' must have at least one non-timeout transition"
            )));
        }
    }

    Ok(())
}
