use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::transaction::Transaction;

/// A subset of a Tendermint block's header: only the fields the engine
/// actually reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    /// 1-indexed; Tendermint heights start at 1.
    pub height: u64,
    pub timestamp: i64,
}

/// An immutable block: a header plus a frozen, ordered sequence of
/// transactions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self { header, transactions }
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }
}

/// An append-only, height-ordered sequence of blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Blockchain {
    blocks: Vec<Block>,
}

impl Blockchain {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Height and length coincide; an empty chain has height 0.
    pub fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Append `block`, requiring `block.header.height == self.height() + 1`.
    pub fn add_block(&mut self, block: Block) -> Result<(), EngineError> {
        let expected = self.height() + 1;
        if block.header.height != expected {
            return Err(EngineError::AddBlock { expected, got: block.header.height });
        }
        self.blocks.push(block);
        Ok(())
    }
}
