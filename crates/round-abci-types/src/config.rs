use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// The environment variable `ConsensusParams::from_env` reads, mirroring
/// the teacher's convention of a `NODE_` / `VALIDATOR_` prefixed knob
/// read once at boot rather than threaded through every call site.
const MAX_PARTICIPANTS_ENV: &str = "ROUND_ABCI_MAX_PARTICIPANTS";

/// Parameters shared by every round in a run: the validator set size and
/// the derived BFT quorum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusParams {
    pub max_participants: u32,
}

impl ConsensusParams {
    pub fn new(max_participants: u32) -> Self {
        Self { max_participants }
    }

    /// Read `max_participants` from `ROUND_ABCI_MAX_PARTICIPANTS`, the
    /// one external knob an outer binary typically sets at boot before
    /// any config file has been parsed (e.g. for a smoke-test deploy).
    pub fn from_env() -> Result<Self, EngineError> {
        let raw = env::var(MAX_PARTICIPANTS_ENV).map_err(|_| {
            EngineError::Internal(format!("{MAX_PARTICIPANTS_ENV} is not set"))
        })?;
        let max_participants = raw.parse::<u32>().map_err(|e| {
            EngineError::Internal(format!("{MAX_PARTICIPANTS_ENV}='{raw}' is not a u32: {e}"))
        })?;
        Ok(Self::new(max_participants))
    }

    /// `ceil((2N + 1) / 3)`, the BFT quorum for `N` participants.
    pub fn threshold(&self) -> u32 {
        threshold(self.max_participants)
    }
}

/// `ceil((2N + 1) / 3)`, the BFT quorum for `N` participants.
pub fn threshold(n: u32) -> u32 {
    (2 * n + 1).div_ceil(3)
}

/// Boot-time configuration for an `AbciApp` run: how many periods'
/// worth of state to retain, and how long each timeout-typed event
/// waits before firing. Deserializable the way the teacher loads its
/// node configuration, via `serde_yaml` at the outer binary's
/// discretion; this crate only defines the shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub max_participants: u32,
    #[serde(default = "default_cleanup_history_depth")]
    pub cleanup_history_depth: u32,
    #[serde(default)]
    pub event_to_timeout: HashMap<String, f64>,
}

fn default_cleanup_history_depth() -> u32 {
    1
}

impl EngineConfig {
    pub fn consensus_params(&self) -> ConsensusParams {
        ConsensusParams::new(self.max_participants)
    }
}
