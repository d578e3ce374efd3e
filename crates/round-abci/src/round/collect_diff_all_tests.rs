use std::collections::BTreeMap;

use round_abci_types::{ConsensusParams, Payload};
use serde_json::json;

use super::{CollectDifferentUntilAll, CollectionRound};
use crate::period_state::PeriodState;
use crate::round::Round;

fn state(all_participants: &[&str]) -> PeriodState {
    PeriodState::new(BTreeMap::from([
        ("all_participants".to_string(), json!(all_participants)),
        ("round_count".to_string(), json!(0)),
    ]))
}

fn payload(sender: &str, value: serde_json::Value) -> Payload {
    Payload {
        tx_kind: "observation".into(),
        id: format!("id-{sender}"),
        sender: sender.into(),
        round_count: 0,
        data: json!({ "value": value }),
    }
}

fn round(all_participants: &[&str]) -> CollectDifferentUntilAll {
    let base = CollectionRound::new(
        "collect_diff_all",
        "observation",
        "value",
        None,
        state(all_participants),
        ConsensusParams::new(all_participants.len() as u32),
    );
    CollectDifferentUntilAll::new(base, "done", "observations")
}

#[test]
fn does_not_fire_until_every_participant_has_submitted() {
    let mut r = round(&["a", "b", "c"]);
    r.process_payload(&payload("a", json!(1))).unwrap();
    assert!(r.end_block().unwrap().is_none());
    r.process_payload(&payload("b", json!(2))).unwrap();
    assert!(r.end_block().unwrap().is_none());
    assert!(!r.collection_threshold_reached());
}

#[test]
fn fires_done_once_the_last_participant_submits() {
    let mut r = round(&["a", "b"]);
    r.process_payload(&payload("a", json!(1))).unwrap();
    r.process_payload(&payload("b", json!(2))).unwrap();
    assert!(r.collection_threshold_reached());
    let (_, event) = r.end_block().unwrap().unwrap();
    assert_eq!(event, "done");
}

#[test]
fn most_voted_payload_is_unavailable_before_all_participants_submit() {
    let mut r = round(&["a", "b"]);
    assert!(r.most_voted_payload().is_err());
    r.process_payload(&payload("a", json!(1))).unwrap();
    r.process_payload(&payload("b", json!(1))).unwrap();
    assert_eq!(r.most_voted_payload().unwrap(), json!(1));
}

#[test]
fn duplicate_sender_is_rejected() {
    let mut r = round(&["a", "b"]);
    r.process_payload(&payload("a", json!(1))).unwrap();
    assert!(r.process_payload(&payload("a", json!(2))).is_err());
}
