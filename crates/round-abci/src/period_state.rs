//! Read-only, round-facing projection over a [`StateDB`] period.
//!
//! Rounds never touch the database directly; they read a `PeriodState`
//! snapshot and, at `end_block`, hand back an updated one plus the
//! key/value deltas that were applied to produce it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use round_abci_types::{EngineError, ROUND_COUNT_DEFAULT};
use serde_json::{json, Value};

use crate::state_db::StateDB;

const PARTICIPANTS_KEY: &str = "participants";
const ALL_PARTICIPANTS_KEY: &str = "all_participants";
const MOST_VOTED_RANDOMNESS_KEY: &str = "most_voted_randomness";
const MOST_VOTED_KEEPER_ADDRESS_KEY: &str = "most_voted_keeper_address";
const BLACKLISTED_KEEPERS_KEY: &str = "blacklisted_keepers";
const PARTICIPANT_TO_SELECTION_KEY: &str = "participant_to_selection";
/// The key under which `schedule_round` mirrors `StateDB::round_count`
/// into the period data, so a round can compare an incoming payload's
/// `round_count` against the value it was scheduled with.
const ROUND_COUNT_KEY: &str = "round_count";

/// An address-keeper address is exactly 42 characters (`0x` + 40 hex
/// digits), matching the original implementation's fixed-width encoding
/// of `blacklisted_keepers` as one concatenated string.
const KEEPER_ADDRESS_LEN: usize = 42;

/// A read-only view of one period's state.
#[derive(Debug, Clone)]
pub struct PeriodState {
    data: BTreeMap<String, Value>,
}

impl PeriodState {
    /// Build a view from an explicit snapshot (round templates hold
    /// their own copy rather than borrowing the `StateDB` directly).
    pub fn new(data: BTreeMap<String, Value>) -> Self {
        Self { data }
    }

    /// Snapshot the current period of `db` into a view.
    pub fn from_db(db: &StateDB) -> Self {
        Self::new(db.current_period_data())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_strict(&self, key: &str) -> Result<&Value, EngineError> {
        match self.data.get(key) {
            None | Some(Value::Null) => Err(EngineError::ValueMissing(key.to_string())),
            Some(v) => Ok(v),
        }
    }

    /// Merge `updates`, returning the new view (the old one is
    /// unaffected — callers hold period state by value across rounds).
    pub fn update(&self, updates: BTreeMap<String, Value>) -> Self {
        let mut data = self.data.clone();
        for (k, v) in updates {
            data.insert(k, v);
        }
        Self { data }
    }

    pub fn into_updates(self) -> BTreeMap<String, Value> {
        self.data
    }

    /// A read-only view of every key this snapshot carries, used by
    /// [`crate::app::AbciApp`] to mirror a round's output back into the
    /// shared [`StateDB`](crate::state_db::StateDB) without consuming it.
    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    /// Mirror `StateDB::round_count` into this view, so the round about
    /// to be scheduled with it can compare an incoming payload's
    /// `round_count` against the value it started with (spec.md §4.E).
    pub fn with_round_count(&self, round_count: i64) -> Self {
        self.update(BTreeMap::from([(ROUND_COUNT_KEY.to_string(), json!(round_count))]))
    }

    /// The participants who have cast a payload for the current round.
    pub fn participants(&self) -> BTreeSet<String> {
        self.string_set(PARTICIPANTS_KEY)
    }

    /// The fixed validator set for the period (set once, at period open).
    pub fn all_participants(&self) -> BTreeSet<String> {
        self.string_set(ALL_PARTICIPANTS_KEY)
    }

    /// `all_participants()`, case-insensitive hex sort; the canonical
    /// iteration order used by `OnlyKeeperSends` and keeper rotation.
    pub fn sorted_participants(&self) -> Vec<String> {
        let mut participants: Vec<String> = self.all_participants().into_iter().collect();
        participants.sort_by_key(|address| address.to_ascii_lowercase());
        participants
    }

    pub fn nb_participants(&self) -> u32 {
        self.all_participants().len() as u32
    }

    /// The `round_count` this period's round was scheduled with
    /// (mirrored from `StateDB::round_count` by `schedule_round`).
    pub fn round_count(&self) -> i64 {
        self.data.get(ROUND_COUNT_KEY).and_then(Value::as_i64).unwrap_or(ROUND_COUNT_DEFAULT)
    }

    fn string_set(&self, key: &str) -> BTreeSet<String> {
        match self.data.get(key) {
            Some(Value::Array(items)) => {
                items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
            }
            _ => BTreeSet::new(),
        }
    }

    pub fn most_voted_randomness(&self) -> Result<String, EngineError> {
        self.get_strict(MOST_VOTED_RANDOMNESS_KEY)
            .and_then(|v| v.as_str().map(str::to_string).ok_or_else(|| {
                EngineError::Internal("most_voted_randomness is not a string".into())
            }))
    }

    /// `int(most_voted_randomness, 16) / (2^256 - 1)`, a value in
    /// `[0, 1]` used to index into `sorted_participants()` for keeper
    /// rotation. `num-bigint` stands in for Python's arbitrary-precision
    /// integers, which the original divides directly.
    pub fn keeper_randomness(&self) -> Result<f64, EngineError> {
        let randomness = self.most_voted_randomness()?;
        let bytes = hex_decode(&randomness)?;
        let value = BigUint::from_bytes_be(&bytes);
        let max = (BigUint::from(1u8) << 256u32) - BigUint::from(1u8);
        let numerator = value.to_f64().unwrap_or(f64::MAX);
        let denominator = max.to_f64().expect("2^256 - 1 fits in f64");
        Ok(numerator / denominator)
    }

    pub fn most_voted_keeper_address(&self) -> Result<String, EngineError> {
        self.get_strict(MOST_VOTED_KEEPER_ADDRESS_KEY)
            .and_then(|v| v.as_str().map(str::to_string).ok_or_else(|| {
                EngineError::Internal("most_voted_keeper_address is not a string".into())
            }))
    }

    pub fn is_keeper_set(&self) -> bool {
        matches!(self.data.get(MOST_VOTED_KEEPER_ADDRESS_KEY), Some(Value::String(_)))
    }

    /// Keepers already rejected this period, stored as one concatenated
    /// string of fixed-width addresses and split back into windows of
    /// [`KEEPER_ADDRESS_LEN`].
    pub fn blacklisted_keepers(&self) -> BTreeSet<String> {
        match self.data.get(BLACKLISTED_KEEPERS_KEY) {
            Some(Value::String(s)) => s
                .as_bytes()
                .chunks(KEEPER_ADDRESS_LEN)
                .map(|chunk| String::from_utf8_lossy(chunk).to_string())
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    /// `{participant -> chosen value}` for the current round's vote,
    /// e.g. `participant_to_selection`.
    pub fn participant_to_selection(&self) -> HashMap<String, Value> {
        match self.data.get(PARTICIPANT_TO_SELECTION_KEY) {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => HashMap::new(),
        }
    }

    /// Any `participant_to_*` map present under `key`, generalizing
    /// `participant_to_selection` to round-specific vote maps
    /// (`participant_to_votes`, `participant_to_randomness`, ...).
    pub fn participant_to_map(&self, key: &str) -> HashMap<String, Value> {
        match self.data.get(key) {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => HashMap::new(),
        }
    }
}

fn hex_decode(s: &str) -> Result<Vec<u8>, EngineError> {
    hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| EngineError::Internal(format!("bad randomness hex: {e}")))
}

/// Build the `participant_to_*` JSON object update for `key`.
pub fn participant_map_update(key: &str, map: &HashMap<String, Value>) -> (String, Value) {
    (key.to_string(), json!(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(pairs: &[(&str, Value)]) -> PeriodState {
        let mut data = BTreeMap::new();
        for (k, v) in pairs {
            data.insert(k.to_string(), v.clone());
        }
        PeriodState::new(data)
    }

    #[test]
    fn sorted_participants_orders_case_insensitively() {
        let state = state_with(&[(ALL_PARTICIPANTS_KEY, json!(["0xC", "0xa", "0xB"]))]);
        assert_eq!(state.sorted_participants(), vec!["0xa", "0xB", "0xC"]);
    }

    #[test]
    fn keeper_randomness_is_fraction_of_max_u256() {
        let state = state_with(&[(MOST_VOTED_RANDOMNESS_KEY, json!("ff"))]);
        // 0xff = 255; 255 / (2^256 - 1) is a tiny positive fraction.
        let value = state.keeper_randomness().unwrap();
        assert!(value > 0.0 && value < 1e-70);
    }

    #[test]
    fn keeper_randomness_of_max_value_is_one() {
        let max_hex = "f".repeat(64);
        let state = state_with(&[(MOST_VOTED_RANDOMNESS_KEY, json!(max_hex))]);
        assert_eq!(state.keeper_randomness().unwrap(), 1.0);
    }

    #[test]
    fn is_keeper_set_false_until_address_present() {
        let state = state_with(&[]);
        assert!(!state.is_keeper_set());
        let state = state.update(BTreeMap::from([(
            MOST_VOTED_KEEPER_ADDRESS_KEY.to_string(),
            json!("0xKeeper"),
        )]));
        assert!(state.is_keeper_set());
    }

    #[test]
    fn blacklisted_keepers_splits_fixed_width_windows() {
        let a = "0x".to_string() + &"a".repeat(40);
        let b = "0x".to_string() + &"b".repeat(40);
        assert_eq!(a.len(), KEEPER_ADDRESS_LEN);
        let concatenated = format!("{a}{b}");
        let state = state_with(&[(BLACKLISTED_KEEPERS_KEY, json!(concatenated))]);
        let blacklisted = state.blacklisted_keepers();
        assert!(blacklisted.contains(&a));
        assert!(blacklisted.contains(&b));
        assert_eq!(blacklisted.len(), 2);
    }

    #[test]
    fn update_does_not_mutate_original() {
        let state = state_with(&[("k", json!(1))]);
        let updated = state.update(BTreeMap::from([("k".to_string(), json!(2))]));
        assert_eq!(state.get("k"), Some(&json!(1)));
        assert_eq!(updated.get("k"), Some(&json!(2)));
    }
}
