//! Checkpoints are trusted headers at known heights.
//!
//! They pin the chain (a header at a checkpoint height must match), anchor block
//! locators below the in-memory window, and let a session bootstrap from a
//! checkpoint instead of genesis.

use bitcoin::block::Header as BlockHeader;
use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u32,
    pub header: BlockHeader,
}

impl Checkpoint {
    pub fn new(height: u32, header: BlockHeader) -> Self {
        Self {
            height,
            header,
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    pub fn timestamp(&self) -> u32 {
        self.header.time
    }
}

/// Checkpoints sorted by height, lowest first. Never empty: genesis is always the first entry.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointManager {
    /// Panics if `genesis` is not at height 0. That is a programming error in
    /// the network parameters, not a runtime condition.
    pub fn new(genesis: Checkpoint) -> Self {
        assert_eq!(genesis.height, 0, "first checkpoint must be at height 0");
        Self {
            checkpoints: vec![genesis],
        }
    }

    /// Register a checkpoint. A second checkpoint at an existing height replaces it.
    pub fn add(&mut self, checkpoint: Checkpoint) {
        match self.checkpoints.binary_search_by_key(&checkpoint.height, |cp| cp.height) {
            Ok(index) => {
                if checkpoint.height == 0 {
                    tracing::warn!("Ignoring attempt to replace the genesis checkpoint");
                    return;
                }
                self.checkpoints[index] = checkpoint;
            }
            Err(index) => self.checkpoints.insert(index, checkpoint),
        }
    }

    pub fn genesis(&self) -> &Checkpoint {
        &self.checkpoints[0]
    }

    pub fn at_height(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .binary_search_by_key(&height, |cp| cp.height)
            .ok()
            .map(|index| &self.checkpoints[index])
    }

    /// The highest checkpoint with `checkpoint.height <= height`.
    pub fn last_at_or_below(&self, height: u32) -> &Checkpoint {
        let index = self.checkpoints.partition_point(|cp| cp.height <= height);
        // index >= 1 because genesis (height 0) always satisfies the predicate
        &self.checkpoints[index.saturating_sub(1)]
    }

    /// The highest checkpoint strictly older than `timestamp`, or genesis.
    pub fn last_before_timestamp(&self, timestamp: u32) -> &Checkpoint {
        self.checkpoints
            .iter()
            .rev()
            .find(|cp| cp.timestamp() < timestamp)
            .unwrap_or_else(|| self.genesis())
    }

    /// Checkpoints strictly below `height`, highest first.
    pub fn below(&self, height: u32) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.iter().rev().filter(move |cp| cp.height < height)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}
