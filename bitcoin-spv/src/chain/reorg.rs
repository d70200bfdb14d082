//! Chain events, including reorganizations.

use bitcoin::{BlockHash, Transaction};

use super::storable_block::StorableBlock;

/// Where an accepted block attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainLocation {
    /// Unknown to the chain.
    None,
    /// On the best chain.
    Main,
    /// On a side branch with no more work than the head.
    Fork,
    /// Parent not known yet.
    Orphan,
}

/// The best chain switched to a heavier branch.
#[derive(Debug, Clone)]
pub struct ReorgEvent {
    /// Last block shared by both branches.
    pub ancestor: StorableBlock,
    /// Blocks leaving the main chain, highest first.
    pub old_blocks: Vec<StorableBlock>,
    /// Blocks joining the main chain, lowest first. The last one is the new head.
    pub new_blocks: Vec<StorableBlock>,
}

impl ReorgEvent {
    pub fn depth(&self) -> usize {
        self.old_blocks.len()
    }

    pub fn new_head(&self) -> Option<&StorableBlock> {
        self.new_blocks.last()
    }

    pub fn old_hashes(&self) -> Vec<BlockHash> {
        self.old_blocks.iter().map(StorableBlock::hash).collect()
    }

    pub fn new_hashes(&self) -> Vec<BlockHash> {
        self.new_blocks.iter().map(StorableBlock::hash).collect()
    }

    /// Transactions whose confirmation the wallet must revoke.
    pub fn disconnected_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.old_blocks.iter().filter_map(StorableBlock::transactions).flatten()
    }

    /// Transactions the wallet must register as confirmed on the new branch.
    pub fn connected_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.new_blocks.iter().filter_map(StorableBlock::transactions).flatten()
    }
}

/// Something observable happened to the chain during `add_block`.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A block was stored on the main chain (extending the head) or on a fork.
    BlockAdded {
        block: StorableBlock,
        location: ChainLocation,
    },
    Reorganized(ReorgEvent),
}
