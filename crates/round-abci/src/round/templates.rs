//! Generic round patterns built on top of the [`Round`] kernel.
//!
//! Every template owns a [`CollectionRound`] (or, for
//! [`OnlyKeeperSends`], an equivalent single-sender validation) and
//! supplies its own `end_block` firing rule. These are expressed as
//! plain structs rather than mix-in inheritance: a `RoundSpec`-shaped
//! set of constructor parameters (event names, collection/selection
//! keys) configures the generic behaviour, per the capability-trait
//! redesign.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use itertools::Itertools;
use round_abci_types::{ConsensusParams, EngineError, Payload};
use serde_json::{json, Value};

use crate::period_state::PeriodState;
use crate::round::{is_majority_possible, most_common_vote, threshold, EventName, Round, Transition};

/// Shared bookkeeping for rounds that collect one payload per sender:
/// round-count/participant/duplicate-sender validation plus the
/// `sender -> Payload` map itself.
#[derive(Debug, Clone)]
pub struct CollectionRound {
    round_id: &'static str,
    allowed_tx_kind: &'static str,
    payload_attribute: &'static str,
    prev_round_allowed_tx_kind: Option<&'static str>,
    period_state: PeriodState,
    consensus_params: ConsensusParams,
    collection: HashMap<String, Payload>,
}

impl CollectionRound {
    pub fn new(
        round_id: &'static str,
        allowed_tx_kind: &'static str,
        payload_attribute: &'static str,
        prev_round_allowed_tx_kind: Option<&'static str>,
        period_state: PeriodState,
        consensus_params: ConsensusParams,
    ) -> Self {
        Self {
            round_id,
            allowed_tx_kind,
            payload_attribute,
            prev_round_allowed_tx_kind,
            period_state,
            consensus_params,
            collection: HashMap::new(),
        }
    }

    pub fn collection(&self) -> &HashMap<String, Payload> {
        &self.collection
    }

    pub fn period_state(&self) -> &PeriodState {
        &self.period_state
    }

    pub fn nb_participants(&self) -> u32 {
        self.consensus_params.max_participants
    }

    fn validate_new_sender(&self, payload: &Payload) -> Result<(), String> {
        let expected = self.period_state.round_count();
        if payload.round_count != expected {
            return Err(format!(
                "expected round count {expected} and got {}",
                payload.round_count
            ));
        }
        if !self.period_state.all_participants().contains(&payload.sender) {
            return Err(format!(
                "{} not in list of participants: {:?}",
                payload.sender,
                self.period_state.sorted_participants()
            ));
        }
        if self.collection.contains_key(&payload.sender) {
            return Err(format!(
                "sender {} has already sent value for round: {}",
                payload.sender, self.round_id
            ));
        }
        Ok(())
    }

    pub fn check_payload(&self, payload: &Payload) -> Result<(), EngineError> {
        self.validate_new_sender(payload).map_err(EngineError::TxInvalid)
    }

    pub fn process_payload(&mut self, payload: &Payload) -> Result<(), EngineError> {
        self.validate_new_sender(payload).map_err(EngineError::TxInvalid)?;
        self.collection.insert(payload.sender.clone(), payload.clone());
        Ok(())
    }

    /// `sender -> payload.data[payload_attribute]`, the "vote" a
    /// value-collecting template (`CollectSameUntilThreshold`,
    /// `Voting`) counts occurrences of.
    fn attribute_votes(&self) -> HashMap<String, Value> {
        self.collection
            .iter()
            .map(|(sender, payload)| {
                (sender.clone(), payload.data.get(self.payload_attribute).cloned().unwrap_or(Value::Null))
            })
            .collect()
    }

    /// `sender -> payload.id`, a proxy for "this sender's distinct
    /// payload" used by templates that collect one (necessarily
    /// different) payload per sender rather than counting agreement on
    /// a value — this reproduces the original's behaviour of running
    /// `is_majority_possible` over the raw, essentially-always-distinct
    /// payload objects (see DESIGN.md).
    fn identity_votes(&self) -> HashMap<String, Value> {
        self.collection.iter().map(|(sender, payload)| (sender.clone(), json!(payload.id))).collect()
    }

    fn collection_json(&self) -> Value {
        serde_json::to_value(&self.collection).expect("collection must serialize")
    }

    fn senders_json(&self) -> Value {
        json!(self.collection.keys().cloned().collect::<BTreeSet<_>>())
    }
}

fn state_update(period_state: &PeriodState, updates: Vec<(&'static str, Value)>) -> PeriodState {
    let map: BTreeMap<String, Value> =
        updates.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    period_state.update(map)
}

/// Collects the same value from `k` of `n` agents; fires `done` on the
/// first value to reach `threshold(n)` occurrences, `none` if the
/// leading value is absent/null, `no_majority` if no value can still
/// reach quorum.
pub struct CollectSameUntilThreshold {
    base: CollectionRound,
    pub done_event: EventName,
    pub none_event: EventName,
    pub no_majority_event: EventName,
    pub collection_key: &'static str,
    pub selection_key: &'static str,
}

impl CollectSameUntilThreshold {
    pub fn new(
        base: CollectionRound,
        done_event: EventName,
        none_event: EventName,
        no_majority_event: EventName,
        collection_key: &'static str,
        selection_key: &'static str,
    ) -> Self {
        Self { base, done_event, none_event, no_majority_event, collection_key, selection_key }
    }

    pub fn threshold_reached(&self) -> bool {
        let votes = self.base.attribute_votes();
        let counts = votes.values().map(Value::to_string).counts();
        counts.values().any(|&count| count as u32 >= threshold(self.base.nb_participants()))
    }
}

impl Round for CollectSameUntilThreshold {
    fn round_id(&self) -> &'static str {
        self.base.round_id
    }
    fn allowed_tx_kind(&self) -> Option<&'static str> {
        Some(self.base.allowed_tx_kind)
    }
    fn payload_attribute(&self) -> &'static str {
        self.base.payload_attribute
    }
    fn prev_round_allowed_tx_kind(&self) -> Option<&'static str> {
        self.base.prev_round_allowed_tx_kind
    }
    fn period_state(&self) -> &PeriodState {
        self.base.period_state()
    }
    fn check_payload(&self, payload: &Payload) -> Result<(), EngineError> {
        self.base.check_payload(payload)
    }
    fn process_payload(&mut self, payload: &Payload) -> Result<(), EngineError> {
        self.base.process_payload(payload)
    }
    fn end_block(&mut self) -> Result<Option<Transition>, EngineError> {
        let votes = self.base.attribute_votes();
        let n = self.base.nb_participants();
        let (most_voted, count) = most_common_vote(&votes);
        if count >= threshold(n) {
            return Ok(Some(match most_voted {
                Some(value) if !value.is_null() => {
                    let updated = state_update(
                        &self.base.period_state,
                        vec![
                            (self.collection_key, self.base.collection_json()),
                            (self.selection_key, value),
                        ],
                    );
                    (updated, self.done_event)
                }
                _ => (self.base.period_state.clone(), self.none_event),
            }));
        }
        if !is_majority_possible(&votes, n) {
            return Ok(Some((self.base.period_state.clone(), self.no_majority_event)));
        }
        Ok(None)
    }
}

/// Collects a different payload from every participant. Only reaches
/// its threshold once all agents have submitted.
pub struct CollectDifferentUntilAll {
    base: CollectionRound,
    pub done_event: EventName,
    pub collection_key: &'static str,
}

impl CollectDifferentUntilAll {
    pub fn new(base: CollectionRound, done_event: EventName, collection_key: &'static str) -> Self {
        Self { base, done_event, collection_key }
    }

    pub fn collection_threshold_reached(&self) -> bool {
        self.base.collection.len() as u32 >= self.base.nb_participants()
    }

    /// The unique value of `payload_attribute` once everyone agrees;
    /// `Err` if not all participants have submitted yet.
    pub fn most_voted_payload(&self) -> Result<Value, EngineError> {
        if !self.collection_threshold_reached() {
            return Err(EngineError::Internal("not enough votes".into()));
        }
        let (value, _) = most_common_vote(&self.base.attribute_votes());
        Ok(value.unwrap_or(Value::Null))
    }
}

impl Round for CollectDifferentUntilAll {
    fn round_id(&self) -> &'static str {
        self.base.round_id
    }
    fn allowed_tx_kind(&self) -> Option<&'static str> {
        Some(self.base.allowed_tx_kind)
    }
    fn payload_attribute(&self) -> &'static str {
        self.base.payload_attribute
    }
    fn prev_round_allowed_tx_kind(&self) -> Option<&'static str> {
        self.base.prev_round_allowed_tx_kind
    }
    fn period_state(&self) -> &PeriodState {
        self.base.period_state()
    }
    fn check_payload(&self, payload: &Payload) -> Result<(), EngineError> {
        self.base.check_payload(payload)
    }
    fn process_payload(&mut self, payload: &Payload) -> Result<(), EngineError> {
        self.base.process_payload(payload)
    }
    fn end_block(&mut self) -> Result<Option<Transition>, EngineError> {
        if !self.collection_threshold_reached() {
            return Ok(None);
        }
        let updated =
            state_update(&self.base.period_state, vec![(self.collection_key, self.base.collection_json())]);
        Ok(Some((updated, self.done_event)))
    }
}

/// Collects a different payload from `k` of `n` agents, then waits
/// `required_block_confirmations` extra blocks before firing `done` —
/// giving slower agents a chance to still join.
pub struct CollectDifferentUntilThreshold {
    base: CollectionRound,
    pub done_event: EventName,
    pub no_majority_event: EventName,
    pub selection_key: &'static str,
    pub collection_key: &'static str,
    required_block_confirmations: u32,
    block_confirmations: u32,
}

impl CollectDifferentUntilThreshold {
    pub fn new(
        base: CollectionRound,
        done_event: EventName,
        no_majority_event: EventName,
        selection_key: &'static str,
        collection_key: &'static str,
        required_block_confirmations: u32,
    ) -> Self {
        Self {
            base,
            done_event,
            no_majority_event,
            selection_key,
            collection_key,
            required_block_confirmations,
            block_confirmations: 0,
        }
    }

    pub fn threshold_reached(&self) -> bool {
        self.base.collection.len() as u32 >= threshold(self.base.nb_participants())
    }

    pub fn block_confirmations(&self) -> u32 {
        self.block_confirmations
    }
}

impl Round for CollectDifferentUntilThreshold {
    fn round_id(&self) -> &'static str {
        self.base.round_id
    }
    fn allowed_tx_kind(&self) -> Option<&'static str> {
        Some(self.base.allowed_tx_kind)
    }
    fn payload_attribute(&self) -> &'static str {
        self.base.payload_attribute
    }
    fn prev_round_allowed_tx_kind(&self) -> Option<&'static str> {
        self.base.prev_round_allowed_tx_kind
    }
    fn period_state(&self) -> &PeriodState {
        self.base.period_state()
    }
    fn check_payload(&self, payload: &Payload) -> Result<(), EngineError> {
        self.base.check_payload(payload)
    }
    fn process_payload(&mut self, payload: &Payload) -> Result<(), EngineError> {
        self.base.process_payload(payload)
    }
    fn end_block(&mut self) -> Result<Option<Transition>, EngineError> {
        if self.threshold_reached() {
            self.block_confirmations += 1;
        }
        if self.threshold_reached() && self.block_confirmations > self.required_block_confirmations {
            let updated = state_update(
                &self.base.period_state,
                vec![
                    (self.selection_key, self.base.senders_json()),
                    (self.collection_key, self.base.collection_json()),
                ],
            );
            return Ok(Some((updated, self.done_event)));
        }
        let n = self.base.nb_participants();
        if !is_majority_possible(&self.base.identity_votes(), n) {
            return Ok(Some((self.base.period_state.clone(), self.no_majority_event)));
        }
        Ok(None)
    }
}

/// As [`CollectDifferentUntilThreshold`], but on `done` filters out
/// entries whose `payload_attribute` is absent/null; fires `none`
/// (rather than `done`) if every submission turned out empty.
pub struct CollectNonEmptyUntilThreshold {
    base: CollectionRound,
    pub done_event: EventName,
    pub none_event: EventName,
    pub no_majority_event: EventName,
    pub selection_key: &'static str,
    pub collection_key: &'static str,
    required_block_confirmations: u32,
    block_confirmations: u32,
}

impl CollectNonEmptyUntilThreshold {
    pub fn new(
        base: CollectionRound,
        done_event: EventName,
        none_event: EventName,
        no_majority_event: EventName,
        selection_key: &'static str,
        collection_key: &'static str,
        required_block_confirmations: u32,
    ) -> Self {
        Self {
            base,
            done_event,
            none_event,
            no_majority_event,
            selection_key,
            collection_key,
            required_block_confirmations,
            block_confirmations: 0,
        }
    }

    pub fn threshold_reached(&self) -> bool {
        self.base.collection.len() as u32 >= threshold(self.base.nb_participants())
    }

    fn non_empty_values(&self) -> Vec<Value> {
        self.base
            .attribute_votes()
            .into_values()
            .filter(|value| !value.is_null())
            .collect()
    }
}

impl Round for CollectNonEmptyUntilThreshold {
    fn round_id(&self) -> &'static str {
        self.base.round_id
    }
    fn allowed_tx_kind(&self) -> Option<&'static str> {
        Some(self.base.allowed_tx_kind)
    }
    fn payload_attribute(&self) -> &'static str {
        self.base.payload_attribute
    }
    fn prev_round_allowed_tx_kind(&self) -> Option<&'static str> {
        self.base.prev_round_allowed_tx_kind
    }
    fn period_state(&self) -> &PeriodState {
        self.base.period_state()
    }
    fn check_payload(&self, payload: &Payload) -> Result<(), EngineError> {
        self.base.check_payload(payload)
    }
    fn process_payload(&mut self, payload: &Payload) -> Result<(), EngineError> {
        self.base.process_payload(payload)
    }
    fn end_block(&mut self) -> Result<Option<Transition>, EngineError> {
        if self.threshold_reached() {
            self.block_confirmations += 1;
        }
        if self.threshold_reached() && self.block_confirmations > self.required_block_confirmations {
            let non_empty = self.non_empty_values();
            let fires_none = non_empty.is_empty();
            let updated = state_update(
                &self.base.period_state,
                vec![
                    (self.selection_key, self.base.senders_json()),
                    (self.collection_key, json!(non_empty)),
                ],
            );
            let event = if fires_none { self.none_event } else { self.done_event };
            return Ok(Some((updated, event)));
        }
        let n = self.base.nb_participants();
        if !is_majority_possible(&self.base.identity_votes(), n) {
            return Ok(Some((self.base.period_state.clone(), self.no_majority_event)));
        }
        Ok(None)
    }
}

/// Accepts a single payload, from whichever sender
/// `period_state.most_voted_keeper_address` names.
pub struct OnlyKeeperSends {
    round_id: &'static str,
    allowed_tx_kind: &'static str,
    payload_attribute: &'static str,
    prev_round_allowed_tx_kind: Option<&'static str>,
    period_state: PeriodState,
    pub done_event: EventName,
    pub fail_event: EventName,
    pub payload_key: &'static str,
    keeper_sent_payload: bool,
    keeper_payload: Option<Value>,
}

impl OnlyKeeperSends {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        round_id: &'static str,
        allowed_tx_kind: &'static str,
        payload_attribute: &'static str,
        prev_round_allowed_tx_kind: Option<&'static str>,
        period_state: PeriodState,
        done_event: EventName,
        fail_event: EventName,
        payload_key: &'static str,
    ) -> Self {
        Self {
            round_id,
            allowed_tx_kind,
            payload_attribute,
            prev_round_allowed_tx_kind,
            period_state,
            done_event,
            fail_event,
            payload_key,
            keeper_sent_payload: false,
            keeper_payload: None,
        }
    }

    pub fn has_keeper_sent_payload(&self) -> bool {
        self.keeper_sent_payload
    }

    fn validate(&self, payload: &Payload) -> Result<(), String> {
        let expected = self.period_state.round_count();
        if payload.round_count != expected {
            return Err(format!("expected round count {expected} and got {}", payload.round_count));
        }
        if !self.period_state.all_participants().contains(&payload.sender) {
            return Err(format!(
                "{} not in list of participants: {:?}",
                payload.sender,
                self.period_state.sorted_participants()
            ));
        }
        let keeper = self
            .period_state
            .most_voted_keeper_address()
            .map_err(|e| format!("no keeper elected yet: {e}"))?;
        if payload.sender != keeper {
            return Err(format!("{} not elected as keeper", payload.sender));
        }
        if self.keeper_sent_payload {
            return Err("keeper payload value already set".to_string());
        }
        Ok(())
    }
}

impl Round for OnlyKeeperSends {
    fn round_id(&self) -> &'static str {
        self.round_id
    }
    fn allowed_tx_kind(&self) -> Option<&'static str> {
        Some(self.allowed_tx_kind)
    }
    fn payload_attribute(&self) -> &'static str {
        self.payload_attribute
    }
    fn prev_round_allowed_tx_kind(&self) -> Option<&'static str> {
        self.prev_round_allowed_tx_kind
    }
    fn period_state(&self) -> &PeriodState {
        &self.period_state
    }
    fn check_payload(&self, payload: &Payload) -> Result<(), EngineError> {
        self.validate(payload).map_err(EngineError::TxInvalid)
    }
    fn process_payload(&mut self, payload: &Payload) -> Result<(), EngineError> {
        self.validate(payload).map_err(EngineError::TxInvalid)?;
        self.keeper_payload = Some(payload.data.get(self.payload_attribute).cloned().unwrap_or(Value::Null));
        self.keeper_sent_payload = true;
        Ok(())
    }
    fn end_block(&mut self) -> Result<Option<Transition>, EngineError> {
        if !self.keeper_sent_payload {
            return Ok(None);
        }
        match &self.keeper_payload {
            Some(value) if !value.is_null() => {
                let updated = state_update(&self.period_state, vec![(self.payload_key, value.clone())]);
                Ok(Some((updated, self.done_event)))
            }
            _ => Ok(Some((self.period_state.clone(), self.fail_event))),
        }
    }
}

/// Collection-based round where each submitted payload carries a
/// ternary vote (`true`/`false`/`null`); fires `done`, `negative` or
/// `none` once the matching count reaches `threshold(n)`.
pub struct Voting {
    base: CollectionRound,
    pub done_event: EventName,
    pub negative_event: EventName,
    pub none_event: EventName,
    pub no_majority_event: EventName,
    pub collection_key: &'static str,
}

impl Voting {
    pub fn new(
        base: CollectionRound,
        done_event: EventName,
        negative_event: EventName,
        none_event: EventName,
        no_majority_event: EventName,
        collection_key: &'static str,
    ) -> Self {
        Self { base, done_event, negative_event, none_event, no_majority_event, collection_key }
    }

    fn vote_count(&self) -> (u32, u32, u32) {
        let votes = self.base.attribute_votes();
        let mut counts = (0u32, 0u32, 0u32);
        for value in votes.values() {
            match value {
                Value::Bool(true) => counts.0 += 1,
                Value::Bool(false) => counts.1 += 1,
                _ => counts.2 += 1,
            }
        }
        counts
    }
}

impl Round for Voting {
    fn round_id(&self) -> &'static str {
        self.base.round_id
    }
    fn allowed_tx_kind(&self) -> Option<&'static str> {
        Some(self.base.allowed_tx_kind)
    }
    fn payload_attribute(&self) -> &'static str {
        self.base.payload_attribute
    }
    fn prev_round_allowed_tx_kind(&self) -> Option<&'static str> {
        self.base.prev_round_allowed_tx_kind
    }
    fn period_state(&self) -> &PeriodState {
        self.base.period_state()
    }
    fn check_payload(&self, payload: &Payload) -> Result<(), EngineError> {
        self.base.check_payload(payload)
    }
    fn process_payload(&mut self, payload: &Payload) -> Result<(), EngineError> {
        self.base.process_payload(payload)
    }
    fn end_block(&mut self) -> Result<Option<Transition>, EngineError> {
        let n = self.base.nb_participants();
        let quorum = threshold(n);
        let (positive, negative, none) = self.vote_count();
        if positive >= quorum {
            let updated =
                state_update(&self.base.period_state, vec![(self.collection_key, self.base.collection_json())]);
            return Ok(Some((updated, self.done_event)));
        }
        if negative >= quorum {
            return Ok(Some((self.base.period_state.clone(), self.negative_event)));
        }
        if none >= quorum {
            return Ok(Some((self.base.period_state.clone(), self.none_event)));
        }
        if !is_majority_possible(&self.base.attribute_votes(), n) {
            return Ok(Some((self.base.period_state.clone(), self.no_majority_event)));
        }
        Ok(None)
    }
}

/// A terminal sink round: accepts no transactions, and any attempt to
/// drive it (`check_payload`/`process_payload`/`end_block`) is an
/// engine bug.
pub struct Degenerate {
    round_id: &'static str,
    period_state: PeriodState,
}

impl Degenerate {
    pub fn new(round_id: &'static str, period_state: PeriodState) -> Self {
        Self { round_id, period_state }
    }
}

impl Round for Degenerate {
    fn round_id(&self) -> &'static str {
        self.round_id
    }
    fn allowed_tx_kind(&self) -> Option<&'static str> {
        None
    }
    fn payload_attribute(&self) -> &'static str {
        ""
    }
    fn prev_round_allowed_tx_kind(&self) -> Option<&'static str> {
        None
    }
    fn period_state(&self) -> &PeriodState {
        &self.period_state
    }
    fn check_payload(&self, _payload: &Payload) -> Result<(), EngineError> {
        Err(EngineError::Internal("DegenerateRound should not be used in operation".into()))
    }
    fn process_payload(&mut self, _payload: &Payload) -> Result<(), EngineError> {
        Err(EngineError::Internal("DegenerateRound should not be used in operation".into()))
    }
    fn end_block(&mut self) -> Result<Option<Transition>, EngineError> {
        Err(EngineError::Internal("DegenerateRound should not be used in operation".into()))
    }
}

#[cfg(test)]
mod collect_same_tests;
#[cfg(test)]
mod collect_diff_all_tests;
#[cfg(test)]
mod collect_diff_threshold_tests;
#[cfg(test)]
mod collect_nonempty_tests;
#[cfg(test)]
mod only_keeper_tests;
#[cfg(test)]
mod voting_tests;
#[cfg(test)]
mod degenerate_tests;
