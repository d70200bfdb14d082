//! Block storage abstraction.
//!
//! Persistence backends live outside this crate. A store is confined to the
//! sync orchestrator task and is never shared, so the trait takes `&mut self`
//! and only requires `Send`.

pub mod memory;

use bitcoin::BlockHash;

use crate::chain::StorableBlock;
use crate::error::StorageResult;

pub use memory::MemoryBlockStore;

pub trait BlockStore: Send {
    fn get(&self, hash: &BlockHash) -> StorageResult<Option<StorableBlock>>;

    /// Insert or replace a block.
    fn put(&mut self, block: StorableBlock) -> StorageResult<()>;

    /// Remove blocks higher than `height`. Returns how many were removed.
    fn remove_above(&mut self, height: u32) -> StorageResult<usize>;

    /// Remove blocks lower than `height`. Returns how many were removed.
    fn remove_below(&mut self, height: u32) -> StorageResult<usize>;

    fn head(&self) -> StorageResult<Option<StorableBlock>>;

    /// Store `block` and make it the head.
    fn set_head(&mut self, block: &StorableBlock) -> StorageResult<()>;

    /// Remove everything, head included.
    fn truncate(&mut self) -> StorageResult<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
