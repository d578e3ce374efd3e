//! Drives one `AbciApp` through the ABCI block lifecycle: `begin_block`
//! / `deliver_tx` / `end_block` / `commit`, enforced as a three-phase
//! state machine the way the original `Period` class rejects calls that
//! arrive out of order (spec.md §4.J).

use round_abci_types::{Block, BlockHeader, Blockchain, EngineError, LedgerKind, LedgerRecover, Payload, Transaction};

use crate::app::AbciApp;

/// Which ABCI call the driver is currently expecting next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    WaitingForBeginBlock,
    WaitingForDeliverTx,
    WaitingForCommit,
}

/// Accumulates the header and transactions of the block currently being
/// built, between `begin_block` and `commit`.
struct BlockBuilder {
    header: BlockHeader,
    transactions: Vec<Transaction>,
}

/// Wraps an [`AbciApp`] with the ABCI phase machine and the replicated
/// [`Blockchain`] log. One `PeriodDriver` per running replica.
pub struct PeriodDriver {
    app: AbciApp,
    blockchain: Blockchain,
    ledger_kind: LedgerKind,
    phase: Phase,
    building: Option<BlockBuilder>,
}

impl PeriodDriver {
    pub fn new(app: AbciApp, ledger_kind: LedgerKind) -> Self {
        Self {
            app,
            blockchain: Blockchain::new(),
            ledger_kind,
            phase: Phase::WaitingForBeginBlock,
            building: None,
        }
    }

    pub fn app(&self) -> &AbciApp {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut AbciApp {
        &mut self.app
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn height(&self) -> u64 {
        self.blockchain.height()
    }

    pub fn blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), EngineError> {
        if self.phase != expected {
            return Err(EngineError::Internal(format!(
                "expected phase {expected:?}, got {:?}",
                self.phase
            )));
        }
        Ok(())
    }

    /// Recoverable check at the mempool boundary: forwards to the
    /// current round regardless of block phase, the way a node's
    /// mempool keeps re-checking pending transactions between blocks.
    pub fn check_tx(&self, payload: &Payload) -> Result<(), EngineError> {
        self.app.check_tx(payload)
    }

    /// Open a new block: advances the engine's clock (firing any
    /// expired timeouts) and starts accumulating transactions.
    ///
    /// Fails once the wrapped `AbciApp` has reached a dead end
    /// (`is_finished`) — there is no round left to drive, so there is
    /// nothing a further block could deliver transactions to.
    pub fn begin_block(&mut self, header: BlockHeader) -> Result<(), EngineError> {
        self.expect_phase(Phase::WaitingForBeginBlock)?;
        if self.app.is_finished() {
            return Err(EngineError::Internal("AbciApp is finished, cannot begin a new block".into()));
        }
        self.app.update_time(header.timestamp as f64);
        self.building = Some(BlockBuilder { header, transactions: Vec::new() });
        self.phase = Phase::WaitingForDeliverTx;
        Ok(())
    }

    /// Verify `tx`'s signature, apply its payload to the current round,
    /// and append it to the block under construction.
    pub fn deliver_tx(&mut self, tx: Transaction, recover: &dyn LedgerRecover) -> Result<(), EngineError> {
        self.expect_phase(Phase::WaitingForDeliverTx)?;
        tx.verify(&self.ledger_kind, recover)?;
        self.app.process_tx(&tx.payload)?;
        self.building
            .as_mut()
            .ok_or_else(|| EngineError::Internal("no block under construction".into()))?
            .transactions
            .push(tx);
        Ok(())
    }

    /// Close the block: just flips the phase. Per spec.md §4.J the
    /// `end_block` transition has no effect of its own — the round is
    /// asked whether it has concluded only after the block is actually
    /// recorded, in `commit`.
    pub fn end_block(&mut self) -> Result<(), EngineError> {
        self.expect_phase(Phase::WaitingForDeliverTx)?;
        self.phase = Phase::WaitingForCommit;
        Ok(())
    }

    /// Finalize the block under construction, then ask the current round
    /// whether it has concluded and drive the transition function if so.
    /// Matches the original's `Period.commit`: `add_block()` first, then
    /// `_update_round()` — so a failed `add_block` (an `AddBlock` height
    /// mismatch) leaves the round un-advanced and `StateDB` unmutated.
    /// At most one round concludes per block, mirroring `_update_round`
    /// concluding exactly one round rather than chaining through
    /// immediately-eligible successors.
    pub fn commit(&mut self) -> Result<u64, EngineError> {
        self.expect_phase(Phase::WaitingForCommit)?;
        let building = self
            .building
            .take()
            .ok_or_else(|| EngineError::Internal("no block under construction".into()))?;
        let block = Block::new(building.header, building.transactions);
        self.blockchain.add_block(block)?;
        self.phase = Phase::WaitingForBeginBlock;
        tracing::info!(height = self.blockchain.height(), "committed block");

        if !self.app.is_finished() && !self.app.is_in_final_round() {
            if let Some((state, event)) = self.app.end_current_round()? {
                self.app.process_event(event, Some(state));
            }
        }

        Ok(self.blockchain.height())
    }

    /// Discard the replicated block log, keeping the running `AbciApp`
    /// and its period state intact. Ambient addition mirroring the
    /// original's `reset_blockchain`, used when a node resyncs from a
    /// snapshot rather than replaying every block.
    ///
    /// `is_replay` forces the phase machine back to
    /// `WaitingForBeginBlock` and drops any block under construction —
    /// the consensus layer is about to replay `begin_block` for height 1
    /// again, regardless of which phase this replica was in.
    pub fn reset_blockchain(&mut self, is_replay: bool) {
        self.blockchain = Blockchain::new();
        if is_replay {
            self.phase = Phase::WaitingForBeginBlock;
            self.building = None;
        }
    }
}
