//! Block locators for `getheaders` / `getblocks`.
//!
//! A locator starts at the tip, lists the ten most recent blocks one by one,
//! then doubles the step on every entry until it reaches the lowest block we
//! still hold. Below that it continues through checkpoints down to genesis,
//! so a peer can always find a common ancestor.

use bitcoin::BlockHash;
use bitcoin::consensus::encode::serialize;

/// Entries added one block apart before the step starts doubling.
pub const LINEAR_ENTRIES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocator(Vec<BlockHash>);

impl BlockLocator {
    pub fn hashes(&self) -> &[BlockHash] {
        &self.0
    }

    pub fn into_hashes(self) -> Vec<BlockHash> {
        self.0
    }

    pub fn tip(&self) -> Option<BlockHash> {
        self.0.first().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wire form: varint count followed by the 32-byte hashes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serialize(&self.0)
    }
}

/// Build a locator over heights `base_height..=tip_height`.
///
/// `hash_at` resolves main-chain heights in that range; `anchors` are hashes
/// below `base_height`, highest first (checkpoints ending with genesis).
pub fn build_block_locator<F, A>(tip_height: u32, base_height: u32, hash_at: F, anchors: A) -> BlockLocator
where
    F: Fn(u32) -> Option<BlockHash>,
    A: IntoIterator<Item = BlockHash>,
{
    let mut hashes = Vec::new();
    let mut height = tip_height;
    let mut step = 1u32;

    while height >= base_height {
        if let Some(hash) = hash_at(height) {
            hashes.push(hash);
        }
        if height == base_height {
            break;
        }
        if hashes.len() >= LINEAR_ENTRIES {
            step = step.saturating_mul(2);
        }
        height = height.saturating_sub(step).max(base_height);
    }

    for anchor in anchors {
        if !hashes.contains(&anchor) {
            hashes.push(anchor);
        }
    }

    BlockLocator(hashes)
}
