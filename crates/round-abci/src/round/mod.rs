//! The round kernel: the contract every concrete round implements, plus
//! the quorum arithmetic every template builds on.

pub mod templates;

use std::collections::HashMap;

use itertools::Itertools;
use round_abci_types::{EngineError, Payload};
use serde_json::Value;

pub use round_abci_types::threshold;

/// A round's place in the transition function: which event it fires
/// when it concludes.
pub type EventName = &'static str;

/// The stable identifier a transition function keys its states by —
/// every concrete round's `round_id()`.
pub type RoundId = &'static str;

/// Something a round returns to `end_block`: the updated state plus
/// the event that should drive the transition function.
pub type Transition = (crate::period_state::PeriodState, EventName);

/// The contract every concrete round implements.
///
/// `check_payload`/`process_payload` carry the round-specific
/// acceptance logic; [`check_tx`](Round::check_tx) and
/// [`process_tx`](Round::process_tx) are provided default methods that
/// wrap them with the `tx_kind` classification shared by every round
/// (spec.md §4.G).
pub trait Round {
    /// A short, stable identifier, e.g. `"collect_votes"`.
    fn round_id(&self) -> &'static str;

    /// The only `tx_kind` this round accepts, or `None` if it accepts
    /// no transactions at all (a [`templates::Degenerate`] sink).
    fn allowed_tx_kind(&self) -> Option<&'static str>;

    /// The payload field this round inspects to determine majority.
    fn payload_attribute(&self) -> &'static str;

    /// The outgoing round's `allowed_tx_kind`, passed down by
    /// `schedule_round` only when it differs from this round's own —
    /// stragglers from a round that shared our `tx_kind` are not late,
    /// they're just more of our own traffic.
    fn prev_round_allowed_tx_kind(&self) -> Option<&'static str>;

    /// The period-state snapshot this round instance was scheduled with.
    /// Used by [`crate::app::AbciApp::process_event`] to carry the state
    /// forward unchanged when a round concludes without an explicit
    /// `end_block` result (a timeout firing on a round nobody has voted
    /// in yet).
    fn period_state(&self) -> &crate::period_state::PeriodState;

    /// Round-specific acceptance check, called without mutating state.
    /// Precondition violations are reported as [`EngineError::TxInvalid`].
    fn check_payload(&self, payload: &Payload) -> Result<(), EngineError>;

    /// Round-specific acceptance and state mutation. Only ever called
    /// after the corresponding `check_payload` would have succeeded.
    fn process_payload(&mut self, payload: &Payload) -> Result<(), EngineError>;

    /// Called once per committed block. `None` means the round has not
    /// yet concluded; `Some` carries the updated state and the event
    /// that should drive the transition function.
    fn end_block(&mut self) -> Result<Option<Transition>, EngineError>;

    /// Classify an incoming `tx_kind` against this round's own and the
    /// outgoing round's kind, without inspecting the payload body.
    fn classify_tx_kind(&self, tx_kind: &str) -> Result<(), EngineError> {
        if let Some(prev) = self.prev_round_allowed_tx_kind() {
            if tx_kind == prev {
                return Err(EngineError::LateArriving(tx_kind.to_string()));
            }
        }
        match self.allowed_tx_kind() {
            Some(allowed) if allowed == tx_kind => Ok(()),
            _ => Err(EngineError::TxKindUnknown(tx_kind.to_string())),
        }
    }

    /// Recoverable check: rejects at the mempool boundary, never
    /// mutates state.
    fn check_tx(&self, payload: &Payload) -> Result<(), EngineError> {
        self.classify_tx_kind(&payload.tx_kind)?;
        self.check_payload(payload)
    }

    /// Consensus-accepted application: any failure here means the
    /// replicas have diverged or a round author wired something up
    /// wrong, so it is always reported as `Internal` regardless of its
    /// origin (spec.md §7 propagation policy).
    fn process_tx(&mut self, payload: &Payload) -> Result<(), EngineError> {
        self.classify_tx_kind(&payload.tx_kind).map_err(to_internal)?;
        self.process_payload(payload).map_err(to_internal)
    }
}

fn to_internal(err: EngineError) -> EngineError {
    match err {
        EngineError::Internal(_) => err,
        other => EngineError::Internal(other.to_string()),
    }
}

/// Count votes by their serialized value, grouping structurally equal
/// `Value`s together regardless of key insertion order within objects
/// (votes are normally primitives, so this rarely matters in practice).
fn vote_counts(votes: &HashMap<String, Value>) -> HashMap<String, u32> {
    votes.values().map(Value::to_string).counts().into_iter().map(|(k, v)| (k, v as u32)).collect()
}

/// `remaining = N - |votes|`; succeeds (vacuously, with 0 votes cast)
/// unless `remaining + max_count < threshold(N)`.
pub fn is_majority_possible(votes: &HashMap<String, Value>, n: u32) -> bool {
    let max_count = vote_counts(votes).values().copied().max().unwrap_or(0);
    let remaining = n.saturating_sub(votes.len() as u32);
    remaining + max_count >= threshold(n)
}

/// Validate and simulate adding `voter`'s `vote` to `votes`, then
/// re-check [`is_majority_possible`]. Fails with `Internal` if `voter`
/// already voted or the vote bag is already full.
pub fn is_majority_possible_with_new_voter(
    votes: &HashMap<String, Value>,
    voter: &str,
    vote: Value,
    n: u32,
) -> Result<bool, EngineError> {
    if votes.contains_key(voter) {
        return Err(EngineError::Internal(format!("voter '{voter}' has already voted")));
    }
    if votes.len() as u32 > n.saturating_sub(1) {
        return Err(EngineError::Internal(
            "cannot add a vote beyond the participant count".into(),
        ));
    }
    let mut extended = votes.clone();
    extended.insert(voter.to_string(), vote);
    Ok(is_majority_possible(&extended, n))
}

/// The most common vote value and its count, or `(None, 0)` if `votes`
/// is empty.
pub fn most_common_vote(votes: &HashMap<String, Value>) -> (Option<Value>, u32) {
    let mut best: Option<(&Value, u32)> = None;
    let mut counts: HashMap<String, (Value, u32)> = HashMap::new();
    for value in votes.values() {
        let key = value.to_string();
        let entry = counts.entry(key).or_insert((value.clone(), 0));
        entry.1 += 1;
    }
    for (value, count) in counts.values() {
        if best.map(|(_, c)| count > &c).unwrap_or(true) {
            best = Some((value, *count));
        }
    }
    match best {
        Some((value, count)) => (Some(value.clone()), count),
        None => (None, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn votes(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn threshold_scenario_from_spec() {
        assert_eq!(threshold(4), 3);
    }

    #[test]
    fn three_of_four_with_split_vote_is_still_possible() {
        let v = votes(&[("a", json!("X")), ("b", json!("X")), ("c", json!("Y"))]);
        assert!(is_majority_possible(&v, 4));
    }

    #[test]
    fn fourth_matching_vote_reaches_threshold() {
        let v = votes(&[("a", json!("X")), ("b", json!("X")), ("c", json!("Y"))]);
        let extended = is_majority_possible_with_new_voter(&v, "d", json!("X"), 4).unwrap();
        assert!(extended);
        let (value, count) = most_common_vote(&votes(&[
            ("a", json!("X")),
            ("b", json!("X")),
            ("c", json!("Y")),
            ("d", json!("X")),
        ]));
        assert_eq!(value, Some(json!("X")));
        assert_eq!(count, 3);
    }

    #[test]
    fn zero_votes_cast_succeeds_vacuously() {
        assert!(is_majority_possible(&HashMap::new(), 4));
    }

    #[test]
    fn with_new_voter_rejects_a_repeat_sender() {
        let v = votes(&[("a", json!("X"))]);
        let err = is_majority_possible_with_new_voter(&v, "a", json!("Y"), 4).unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[test]
    fn classify_tx_kind_distinguishes_late_from_unknown() {
        struct Fixture(crate::period_state::PeriodState);
        impl Round for Fixture {
            fn round_id(&self) -> &'static str {
                "fixture"
            }
            fn allowed_tx_kind(&self) -> Option<&'static str> {
                Some("B")
            }
            fn payload_attribute(&self) -> &'static str {
                "value"
            }
            fn prev_round_allowed_tx_kind(&self) -> Option<&'static str> {
                Some("A")
            }
            fn period_state(&self) -> &crate::period_state::PeriodState {
                &self.0
            }
            fn check_payload(&self, _: &Payload) -> Result<(), EngineError> {
                Ok(())
            }
            fn process_payload(&mut self, _: &Payload) -> Result<(), EngineError> {
                Ok(())
            }
            fn end_block(&mut self) -> Result<Option<Transition>, EngineError> {
                Ok(None)
            }
        }
        let round = Fixture(crate::period_state::PeriodState::new(Default::default()));
        assert_eq!(round.classify_tx_kind("A"), Err(EngineError::LateArriving("A".into())));
        assert_eq!(round.classify_tx_kind("C"), Err(EngineError::TxKindUnknown("C".into())));
        assert_eq!(round.classify_tx_kind("B"), Ok(()));
    }

    proptest! {
        #[test]
        fn is_majority_possible_matches_brute_force(
            n in 1u32..8,
            vote_values in proptest::collection::vec(0u8..3, 0..8),
        ) {
            let n_votes = vote_values.len().min(n as usize);
            let votes: HashMap<String, Value> = vote_values
                .iter()
                .take(n_votes)
                .enumerate()
                .map(|(i, v)| (format!("p{i}"), json!(v)))
                .collect();
            let expected = brute_force_majority_possible(&votes, n);
            prop_assert_eq!(is_majority_possible(&votes, n), expected);
        }
    }

    fn brute_force_majority_possible(votes: &HashMap<String, Value>, n: u32) -> bool {
        let remaining = n.saturating_sub(votes.len() as u32);
        let counts = vote_counts(votes);
        // Try assigning every one of the `remaining` undecided voters to
        // each observed value (or a brand new value) and see if any
        // assignment reaches the threshold.
        let candidates: Vec<String> =
            if counts.is_empty() { vec!["new".to_string()] } else { counts.keys().cloned().collect() };
        for candidate in &candidates {
            let mut projected = counts.clone();
            *projected.entry(candidate.clone()).or_insert(0) += remaining;
            if projected.values().copied().max().unwrap_or(0) >= threshold(n) {
                return true;
            }
        }
        counts.values().copied().max().unwrap_or(0) >= threshold(n)
    }
}
