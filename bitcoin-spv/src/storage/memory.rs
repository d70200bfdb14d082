//! In-memory block store.

use std::collections::HashMap;

use bitcoin::BlockHash;

use crate::chain::StorableBlock;
use crate::error::{StorageError, StorageResult};
use crate::storage::BlockStore;

/// Block store backed by a `HashMap`. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: HashMap<BlockHash, StorableBlock>,
    head: Option<BlockHash>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Heights of all stored blocks, ascending.
    pub fn heights(&self) -> Vec<u32> {
        let mut heights: Vec<u32> = self.blocks.values().map(StorableBlock::height).collect();
        heights.sort_unstable();
        heights
    }

    fn remove_where(&mut self, predicate: impl Fn(&StorableBlock) -> bool) -> usize {
        let before = self.blocks.len();
        self.blocks.retain(|_, block| !predicate(block));
        if let Some(head) = self.head {
            if !self.blocks.contains_key(&head) {
                self.head = None;
            }
        }
        before - self.blocks.len()
    }
}

impl BlockStore for MemoryBlockStore {
    fn get(&self, hash: &BlockHash) -> StorageResult<Option<StorableBlock>> {
        Ok(self.blocks.get(hash).cloned())
    }

    fn put(&mut self, block: StorableBlock) -> StorageResult<()> {
        self.blocks.insert(block.hash(), block);
        Ok(())
    }

    fn remove_above(&mut self, height: u32) -> StorageResult<usize> {
        Ok(self.remove_where(|block| block.height() > height))
    }

    fn remove_below(&mut self, height: u32) -> StorageResult<usize> {
        Ok(self.remove_where(|block| block.height() < height))
    }

    fn head(&self) -> StorageResult<Option<StorableBlock>> {
        match self.head {
            None => Ok(None),
            Some(hash) => self
                .blocks
                .get(&hash)
                .cloned()
                .map(Some)
                .ok_or_else(|| StorageError::InconsistentState(format!("head {} missing from store", hash))),
        }
    }

    fn set_head(&mut self, block: &StorableBlock) -> StorageResult<()> {
        self.blocks.insert(block.hash(), block.clone());
        self.head = Some(block.hash());
        Ok(())
    }

    fn truncate(&mut self) -> StorageResult<()> {
        self.blocks.clear();
        self.head = None;
        Ok(())
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }
}
