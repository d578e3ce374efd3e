use thiserror::Error;

/// The engine's error taxonomy.
///
/// `check_tx`/`check_payload` failures are recoverable: the underlying
/// consensus engine rejects the transaction at its mempool boundary.
/// `process_tx`/`process_payload` failures are treated as `Internal`
/// because the consensus layer has already accepted the transaction by
/// the time `process_tx` runs, so a failure there means the replicas
/// have diverged or a round author wired something up wrong.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// An engine invariant was violated (bad phase, missing class
    /// attribute, inconsistent bookkeeping lengths). Non-recoverable.
    #[error("internal error: {0}")]
    Internal(String),

    /// The transaction carries a `tx_kind` the round does not accept.
    #[error("unrecognized tx_kind: {0}")]
    TxKindUnknown(String),

    /// The `tx_kind` matches the *previous* round's allowed kind; a
    /// straggler from the round that just ended.
    #[error("late-arriving tx_kind: {0}")]
    LateArriving(String),

    /// The payload's kind is accepted but it violates a precondition
    /// (wrong round_count, non-participant sender, duplicate sender).
    #[error("invalid payload: {0}")]
    TxInvalid(String),

    /// The recovered signer set does not contain the payload's sender.
    #[error("signature invalid")]
    SignatureInvalid,

    /// `Blockchain::add_block` was called with a non-consecutive height.
    #[error("cannot add block at height {got}: expected {expected}")]
    AddBlock { expected: u64, got: u64 },

    /// `StateDB::get_strict` was called on an absent or `null` key.
    #[error("value missing for key '{0}'")]
    ValueMissing(String),

    /// A payload variant tag was re-registered under a different variant
    /// name.
    #[error("tx_kind '{tx_kind}' already registered to '{existing}', cannot register '{attempted}'")]
    DuplicateTxKind { tx_kind: String, existing: String, attempted: String },

    /// A payload variant was registered without a non-empty `tx_kind`.
    #[error("payload variant '{0}' did not declare a tx_kind")]
    MissingTxKind(String),
}
