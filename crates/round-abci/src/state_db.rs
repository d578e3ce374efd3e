//! Replicated, period-scoped key/value store.
//!
//! Every replica's `AbciApp` holds one `StateDB`. Each round's
//! `end_block` reads and writes it through a `PeriodState` view so that,
//! given the same sequence of delivered transactions, every honest
//! replica computes the same value for every key.

use std::collections::BTreeMap;

use round_abci_types::{EngineError, ROUND_COUNT_DEFAULT};
use serde_json::Value;

/// A replicated key/value store, partitioned by period.
///
/// Keys written with [`StateDB::set`] land in the *current* period's map.
/// Keys listed in `cross_period_persisted_keys` are additionally copied
/// forward into the next period's map by [`StateDB::add_new_period`], so
/// a round early in period `n + 1` can still read state a round wrote in
/// period `n` (e.g. the participant set, carried across a period reset).
#[derive(Debug, Clone)]
pub struct StateDB {
    current_period: i64,
    data: BTreeMap<i64, BTreeMap<String, Value>>,
    cross_period_persisted_keys: Vec<String>,
    round_count: i64,
}

impl StateDB {
    /// `initial_data` seeds period 0; `cross_period_persisted_keys` names
    /// the keys `add_new_period` copies forward.
    pub fn new(
        initial_data: BTreeMap<String, Value>,
        cross_period_persisted_keys: Vec<String>,
    ) -> Self {
        let mut data = BTreeMap::new();
        data.insert(0, initial_data);
        Self { current_period: 0, data, cross_period_persisted_keys, round_count: ROUND_COUNT_DEFAULT }
    }

    pub fn current_period(&self) -> i64 {
        self.current_period
    }

    pub fn round_count(&self) -> i64 {
        self.round_count
    }

    pub fn round_count_mut(&mut self) -> &mut i64 {
        &mut self.round_count
    }

    pub fn increment_round_count(&mut self) {
        self.round_count += 1;
    }

    /// Look up `key` in the current period, falling back to `default`
    /// when absent.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).cloned().unwrap_or(default)
    }

    /// Look up `key` in the current period, or `None` when absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(&self.current_period).and_then(|period| period.get(key))
    }

    /// As [`get`](Self::get), but `None` only when the key is absent
    /// entirely; a present `Value::Null` is returned as `Some(Null)`.
    pub fn get_opt(&self, key: &str) -> Option<&Value> {
        self.get(key)
    }

    /// Look up `key`, rejecting both an absent key and a present-but-null
    /// one. Rounds use this for fields they require to already be set.
    pub fn get_strict(&self, key: &str) -> Result<&Value, EngineError> {
        match self.get(key) {
            None | Some(Value::Null) => Err(EngineError::ValueMissing(key.to_string())),
            Some(v) => Ok(v),
        }
    }

    /// Write `key` into the current period.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.entry(self.current_period).or_default().insert(key.into(), value);
    }

    /// Merge `updates` into the current period.
    pub fn update_current_period(&mut self, updates: BTreeMap<String, Value>) {
        let period = self.data.entry(self.current_period).or_default();
        for (k, v) in updates {
            period.insert(k, v);
        }
    }

    /// Open period `new_period`, seeded with `initial_data` plus whatever
    /// `cross_period_persisted_keys` hold in the period being closed.
    /// `new_period` need not be `current_period + 1` — re-opening an
    /// already-seen period is permitted (spec.md §4.D, §9 open question):
    /// it logs a warning and overwrites that period's data rather than
    /// rejecting the call.
    pub fn add_new_period(&mut self, new_period: i64, initial_data: BTreeMap<String, Value>) {
        let mut seeded = initial_data;
        if let Some(closing) = self.data.get(&self.current_period) {
            for key in &self.cross_period_persisted_keys {
                if let Some(value) = closing.get(key) {
                    seeded.insert(key.clone(), value.clone());
                }
            }
        }
        if self.data.contains_key(&new_period) {
            tracing::warn!(period = new_period, "overwriting an already-opened period");
        }
        self.data.insert(new_period, seeded);
        self.current_period = new_period;
    }

    /// A snapshot of the current period's full key/value map.
    pub fn current_period_data(&self) -> BTreeMap<String, Value> {
        self.data.get(&self.current_period).cloned().unwrap_or_default()
    }

    /// Drop all periods but the most recent `max(depth, 1)`.
    pub fn cleanup(&mut self, depth: u32) {
        let keep = depth.max(1) as i64;
        let cutoff = self.current_period - keep + 1;
        self.data.retain(|period, _| *period >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> StateDB {
        StateDB::new(BTreeMap::new(), vec!["participants".to_string()])
    }

    #[test]
    fn new_opens_period_zero() {
        let db = db();
        assert_eq!(db.current_period(), 0);
        assert_eq!(db.round_count(), -1);
    }

    #[test]
    fn get_or_falls_back_to_default() {
        let db = db();
        assert_eq!(db.get_or("missing", json!(42)), json!(42));
    }

    #[test]
    fn get_strict_rejects_absent_and_null() {
        let mut db = db();
        assert!(db.get_strict("missing").is_err());
        db.set("k", Value::Null);
        assert!(db.get_strict("k").is_err());
        db.set("k", json!(1));
        assert_eq!(db.get_strict("k").unwrap(), &json!(1));
    }

    #[test]
    fn add_new_period_carries_cross_period_keys_forward() {
        let mut db = db();
        db.set("participants", json!(["a", "b"]));
        db.set("scratch", json!("period0 only"));
        db.add_new_period(1, BTreeMap::new());
        assert_eq!(db.current_period(), 1);
        assert_eq!(db.get("participants"), Some(&json!(["a", "b"])));
        assert_eq!(db.get("scratch"), None);
    }

    #[test]
    fn add_new_period_overwrite_replaces_existing_period() {
        let mut db = db();
        db.add_new_period(1, BTreeMap::new());
        db.set("x", json!(1));
        db.current_period = 0;
        db.add_new_period(1, BTreeMap::new());
        assert_eq!(db.current_period(), 1);
        assert_eq!(db.get("x"), None);
    }

    #[test]
    fn add_new_period_can_open_an_arbitrary_period_index() {
        let mut db = db();
        db.add_new_period(7, BTreeMap::new());
        assert_eq!(db.current_period(), 7);
        assert!(db.data.contains_key(&7));
    }

    #[test]
    fn cleanup_retains_only_recent_periods() {
        let mut db = db();
        for p in 1..=5 {
            db.add_new_period(p, BTreeMap::new());
        }
        assert_eq!(db.current_period(), 5);
        db.cleanup(2);
        assert_eq!(db.data.len(), 2);
        assert!(db.data.contains_key(&4));
        assert!(db.data.contains_key(&5));
        assert!(!db.data.contains_key(&3));
    }

    #[test]
    fn cleanup_zero_depth_treated_as_one() {
        let mut db = db();
        db.add_new_period(1, BTreeMap::new());
        db.cleanup(0);
        assert_eq!(db.data.len(), 1);
        assert!(db.data.contains_key(&1));
    }

    #[test]
    fn increment_round_count_advances_from_minus_one() {
        let mut db = db();
        db.increment_round_count();
        assert_eq!(db.round_count(), 0);
        db.increment_round_count();
        assert_eq!(db.round_count(), 1);
    }
}
