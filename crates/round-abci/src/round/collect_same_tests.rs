use std::collections::BTreeMap;

use round_abci_types::{ConsensusParams, Payload};
use serde_json::json;

use super::{CollectSameUntilThreshold, CollectionRound};
use crate::period_state::PeriodState;
use crate::round::Round;

fn state(all_participants: &[&str], round_count: i64) -> PeriodState {
    PeriodState::new(BTreeMap::from([
        ("all_participants".to_string(), json!(all_participants)),
        ("round_count".to_string(), json!(round_count)),
    ]))
}

fn payload(sender: &str, round_count: i64, value: serde_json::Value) -> Payload {
    Payload {
        tx_kind: "vote".into(),
        id: format!("id-{sender}"),
        sender: sender.into(),
        round_count,
        data: json!({ "value": value }),
    }
}

fn round(all_participants: &[&str], round_count: i64) -> CollectSameUntilThreshold {
    let base = CollectionRound::new(
        "collect_same",
        "vote",
        "value",
        None,
        state(all_participants, round_count),
        ConsensusParams::new(all_participants.len() as u32),
    );
    CollectSameUntilThreshold::new(base, "done", "none", "no_majority", "collection", "most_voted")
}

#[test]
fn fires_done_once_threshold_value_reaches_quorum() {
    // N = 4 => threshold = 3, matching spec.md §8 scenario 1.
    let mut r = round(&["a", "b", "c", "d"], 0);
    r.process_payload(&payload("a", 0, json!("X"))).unwrap();
    r.process_payload(&payload("b", 0, json!("X"))).unwrap();
    assert!(r.end_block().unwrap().is_none());
    r.process_payload(&payload("c", 0, json!("Y"))).unwrap();
    assert!(r.end_block().unwrap().is_none());
    r.process_payload(&payload("d", 0, json!("X"))).unwrap();
    let (_, event) = r.end_block().unwrap().unwrap();
    assert_eq!(event, "done");
}

#[test]
fn fires_none_when_leading_value_is_null() {
    let mut r = round(&["a", "b", "c"], 0);
    r.process_payload(&payload("a", 0, json!(null))).unwrap();
    r.process_payload(&payload("b", 0, json!(null))).unwrap();
    r.process_payload(&payload("c", 0, json!(null))).unwrap();
    let (_, event) = r.end_block().unwrap().unwrap();
    assert_eq!(event, "none");
}

#[test]
fn fires_no_majority_once_quorum_is_unreachable() {
    let mut r = round(&["a", "b", "c", "d"], 0);
    r.process_payload(&payload("a", 0, json!("X"))).unwrap();
    r.process_payload(&payload("b", 0, json!("Y"))).unwrap();
    r.process_payload(&payload("c", 0, json!("Z"))).unwrap();
    let (_, event) = r.end_block().unwrap().unwrap();
    assert_eq!(event, "no_majority");
}

#[test]
fn wrong_round_count_is_tx_invalid_on_check_and_internal_on_process() {
    // spec.md §8 scenario 2: period_state.round_count = 5, payload carries 4.
    let r = round(&["a", "b"], 5);
    let stale = payload("a", 4, json!("X"));
    assert!(matches!(r.check_payload(&stale), Err(round_abci_types::EngineError::TxInvalid(_))));
    let mut r = round(&["a", "b"], 5);
    assert!(matches!(r.process_tx(&stale), Err(round_abci_types::EngineError::Internal(_))));
}

#[test]
fn duplicate_sender_is_rejected() {
    let mut r = round(&["a", "b"], 0);
    r.process_payload(&payload("a", 0, json!("X"))).unwrap();
    let err = r.process_payload(&payload("a", 0, json!("X"))).unwrap_err();
    assert!(matches!(err, round_abci_types::EngineError::TxInvalid(_)));
}

#[test]
fn non_participant_sender_is_rejected() {
    let r = round(&["a", "b"], 0);
    let err = r.check_payload(&payload("mallory", 0, json!("X"))).unwrap_err();
    assert!(matches!(err, round_abci_types::EngineError::TxInvalid(_)));
}
