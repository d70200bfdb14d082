//! Tracking of side-branch tips.
//!
//! The main chain head lives in `ChainState`. This module only remembers where
//! each known fork currently ends, so forks can be listed, compared and pruned.

use std::collections::HashMap;

use bitcoin::BlockHash;
use tracing::debug;

use super::ChainWork;
use super::storable_block::StorableBlock;

/// Default number of fork tips remembered at once.
pub const DEFAULT_MAX_FORK_TIPS: usize = 16;

/// The end of a side branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: BlockHash,
    pub height: u32,
    pub chain_work: ChainWork,
}

impl From<&StorableBlock> for ChainTip {
    fn from(block: &StorableBlock) -> Self {
        Self {
            hash: block.hash(),
            height: block.height(),
            chain_work: block.work().clone(),
        }
    }
}

/// Fork tips keyed by hash, bounded by `max_tips` with the weakest evicted first.
#[derive(Debug)]
pub struct ChainTipManager {
    tips: HashMap<BlockHash, ChainTip>,
    max_tips: usize,
}

impl Default for ChainTipManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FORK_TIPS)
    }
}

impl ChainTipManager {
    pub fn new(max_tips: usize) -> Self {
        Self {
            tips: HashMap::new(),
            max_tips: max_tips.max(1),
        }
    }

    /// Record `block` as a fork tip. If its parent was a tip, the parent is replaced.
    ///
    /// Returns the hash of a tip evicted to make room, if any.
    pub fn extend(&mut self, block: &StorableBlock) -> Option<BlockHash> {
        self.tips.remove(&block.prev_hash());
        let tip = ChainTip::from(block);

        let evicted = if self.tips.len() >= self.max_tips && !self.tips.contains_key(&tip.hash) {
            self.evict_weakest()
        } else {
            None
        };

        self.tips.insert(tip.hash, tip);
        evicted
    }

    pub fn remove(&mut self, hash: &BlockHash) -> Option<ChainTip> {
        self.tips.remove(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.tips.contains_key(hash)
    }

    /// Tips sorted by work, heaviest first.
    pub fn tips(&self) -> Vec<&ChainTip> {
        let mut tips: Vec<&ChainTip> = self.tips.values().collect();
        tips.sort_by(|a, b| b.chain_work.cmp(&a.chain_work).then(a.height.cmp(&b.height)));
        tips
    }

    pub fn best(&self) -> Option<&ChainTip> {
        self.tips.values().max_by(|a, b| a.chain_work.cmp(&b.chain_work))
    }

    /// Drop tips whose height is below `height`. Returns the dropped hashes.
    pub fn prune_below(&mut self, height: u32) -> Vec<BlockHash> {
        let stale: Vec<BlockHash> =
            self.tips.values().filter(|tip| tip.height < height).map(|tip| tip.hash).collect();
        for hash in &stale {
            self.tips.remove(hash);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.tips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tips.is_empty()
    }

    pub fn clear(&mut self) {
        self.tips.clear();
    }

    fn evict_weakest(&mut self) -> Option<BlockHash> {
        let weakest = self.tips.values().min_by(|a, b| a.chain_work.cmp(&b.chain_work)).map(|tip| tip.hash)?;
        self.tips.remove(&weakest);
        debug!("Evicted weakest fork tip {}", weakest);
        Some(weakest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::NetworkParams;

    fn branch(len: usize, nonce_base: u32) -> Vec<StorableBlock> {
        let params = NetworkParams::regtest();
        let mut blocks = vec![StorableBlock::root(params.genesis, 0)];
        for i in 0..len {
            let parent = &blocks[blocks.len() - 1];
            let mut header = params.genesis;
            header.prev_blockhash = parent.hash();
            header.nonce = nonce_base + i as u32;
            let next = parent.build_next(header, None);
            blocks.push(next);
        }
        blocks
    }

    #[test]
    fn test_extend_replaces_parent_tip() {
        let blocks = branch(3, 100);
        let mut tips = ChainTipManager::new(4);
        tips.extend(&blocks[1]);
        tips.extend(&blocks[2]);
        tips.extend(&blocks[3]);

        assert_eq!(tips.len(), 1);
        assert_eq!(tips.best().unwrap().hash, blocks[3].hash());
        assert!(!tips.contains(&blocks[2].hash()));
    }

    #[test]
    fn test_weakest_tip_evicted() {
        let short = branch(1, 10);
        let long = branch(3, 20);
        let other = branch(2, 30);
        let mut tips = ChainTipManager::new(2);
        tips.extend(&short[1]);
        tips.extend(&long[3]);

        let evicted = tips.extend(&other[2]);
        assert_eq!(evicted, Some(short[1].hash()));
        let order: Vec<BlockHash> = tips.tips().iter().map(|t| t.hash).collect();
        assert_eq!(order, vec![long[3].hash(), other[2].hash()]);
    }

    #[test]
    fn test_prune_below() {
        let a = branch(2, 40);
        let b = branch(5, 50);
        let mut tips = ChainTipManager::default();
        tips.extend(&a[2]);
        tips.extend(&b[5]);

        assert_eq!(tips.prune_below(3), vec![a[2].hash()]);
        assert_eq!(tips.len(), 1);
        tips.clear();
        assert!(tips.is_empty());
    }
}
