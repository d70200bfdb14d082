//! The block chain state machine.
//!
//! Blocks live in an arena keyed by hash; parents are resolved by lookup. The
//! main chain is a height index into that arena. All mutation goes through
//! [`ChainState::add_block`]. Every check runs before the first write, so a
//! rejected block leaves the state untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::block::Header as BlockHeader;
use bitcoin::{BlockHash, Transaction};
use tracing::{debug, info, trace, warn};

use super::block_locator::{BlockLocator, build_block_locator};
use super::chain_tip::{ChainTip, ChainTipManager, DEFAULT_MAX_FORK_TIPS};
use super::checkpoints::Checkpoint;
use super::difficulty::{check_proof_of_work, next_retarget_bits};
use super::orphan_pool::{MAX_ORPHAN_BLOCKS, ORPHAN_TIMEOUT, OrphanPool};
use super::reorg::{ChainEvent, ChainLocation, ReorgEvent};
use super::storable_block::StorableBlock;
use crate::error::{ChainError, ChainResult, StorageResult, ValidationError};
use crate::params::NetworkParams;
use crate::storage::BlockStore;

/// Blocks kept in memory below the head.
pub const DEFAULT_MAX_SIZE: u32 = 2500;

/// Longest side branch walked when looking for a fork base.
pub const DEFAULT_MAX_STEP: u32 = 2500;

/// How far ahead of network-adjusted time a header timestamp may be.
pub const ALLOWED_TIME_DRIFT: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ChainStateConfig {
    pub max_size: u32,
    pub max_step: u32,
    pub max_fork_tips: usize,
    pub max_orphans: usize,
    pub orphan_timeout: Duration,
    pub allowed_time_drift: Duration,
}

impl Default for ChainStateConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_step: DEFAULT_MAX_STEP,
            max_fork_tips: DEFAULT_MAX_FORK_TIPS,
            max_orphans: MAX_ORPHAN_BLOCKS,
            orphan_timeout: ORPHAN_TIMEOUT,
            allowed_time_drift: ALLOWED_TIME_DRIFT,
        }
    }
}

/// Result of [`ChainState::add_block`].
#[derive(Debug, Clone)]
pub struct AddBlockOutcome {
    pub hash: BlockHash,
    pub location: ChainLocation,
    /// The placed block. `None` for orphans.
    pub block: Option<StorableBlock>,
    /// Orphans that attached because of this block, in attach order.
    pub connected_orphans: Vec<StorableBlock>,
    /// Observable changes in the order they happened.
    pub events: Vec<ChainEvent>,
    /// True when the block was already known and nothing changed.
    pub duplicate: bool,
}

impl AddBlockOutcome {
    fn unchanged(hash: BlockHash, location: ChainLocation, block: Option<StorableBlock>) -> Self {
        Self {
            hash,
            location,
            block,
            connected_orphans: Vec::new(),
            events: Vec::new(),
            duplicate: true,
        }
    }

    pub fn reorganization(&self) -> Option<&ReorgEvent> {
        self.events.iter().find_map(|event| match event {
            ChainEvent::Reorganized(reorg) => Some(reorg),
            ChainEvent::BlockAdded {
                ..
            } => None,
        })
    }
}

/// One block placed by `attach`, before orphan processing.
struct Attached {
    block: StorableBlock,
    location: ChainLocation,
    event: ChainEvent,
}

pub struct ChainState {
    params: Arc<NetworkParams>,
    config: ChainStateConfig,
    /// Main chain and fork blocks inside the window.
    blocks: HashMap<BlockHash, StorableBlock>,
    /// Main chain: height -> hash, contiguous from `base_height` to the head.
    main_chain: BTreeMap<u32, BlockHash>,
    head: BlockHash,
    base_height: u32,
    orphans: OrphanPool,
    fork_tips: ChainTipManager,
    /// Median peer clock offset in seconds.
    time_offset: i64,
}

impl ChainState {
    /// A chain whose only block is `root`.
    pub fn new(params: Arc<NetworkParams>, config: ChainStateConfig, root: StorableBlock) -> Self {
        let hash = root.hash();
        let height = root.height();
        let orphans = OrphanPool::with_config(config.max_orphans, config.orphan_timeout);
        let fork_tips = ChainTipManager::new(config.max_fork_tips);

        let mut blocks = HashMap::new();
        blocks.insert(hash, root);
        let mut main_chain = BTreeMap::new();
        main_chain.insert(height, hash);

        Self {
            params,
            config,
            blocks,
            main_chain,
            head: hash,
            base_height: height,
            orphans,
            fork_tips,
            time_offset: 0,
        }
    }

    pub fn from_genesis(params: Arc<NetworkParams>, config: ChainStateConfig) -> Self {
        let root = StorableBlock::root(params.genesis, 0);
        Self::new(params, config, root)
    }

    pub fn from_checkpoint(params: Arc<NetworkParams>, config: ChainStateConfig, checkpoint: &Checkpoint) -> Self {
        let root = StorableBlock::root(checkpoint.header, checkpoint.height);
        Self::new(params, config, root)
    }

    /// Restore from `store`, or bootstrap from the last checkpoint before
    /// `fast_catch_up` (genesis when `None`) if the store is empty.
    pub fn load(
        params: Arc<NetworkParams>,
        config: ChainStateConfig,
        store: &mut dyn BlockStore,
        fast_catch_up: Option<u32>,
    ) -> ChainResult<Self> {
        let Some(head) = store.head()? else {
            let checkpoint = match fast_catch_up {
                Some(timestamp) => *params.last_checkpoint_before_timestamp(timestamp),
                None => *params.checkpoints.genesis(),
            };
            info!("Empty block store, starting from checkpoint at height {}", checkpoint.height);
            let state = Self::from_checkpoint(params, config, &checkpoint);
            store.set_head(state.head())?;
            return Ok(state);
        };

        let mut window = vec![head];
        while window.len() <= config.max_size as usize {
            let Some(lowest) = window.last() else {
                break;
            };
            if lowest.height() == 0 {
                break;
            }
            match store.get(&lowest.prev_hash())? {
                Some(parent) => window.push(parent),
                None => break,
            }
        }

        let Some(root) = window.pop() else {
            return Err(crate::error::StorageError::InconsistentState("empty head window".to_string()).into());
        };
        let mut state = Self::new(params, config, root);
        for block in window.into_iter().rev() {
            let hash = block.hash();
            state.main_chain.insert(block.height(), hash);
            state.blocks.insert(hash, block);
            state.head = hash;
        }

        info!("Loaded chain from store: head {} at height {}", state.head, state.current_height());
        Ok(state)
    }

    /// Write the head and the main-chain window to `store`.
    pub fn flush(&self, store: &mut dyn BlockStore) -> StorageResult<()> {
        for hash in self.main_chain.values() {
            if let Some(block) = self.blocks.get(hash) {
                store.put(block.clone())?;
            }
        }
        store.set_head(self.head())?;
        store.remove_above(self.current_height())?;
        debug!("Flushed {} blocks to store", self.main_chain.len());
        Ok(())
    }

    pub fn params(&self) -> &Arc<NetworkParams> {
        &self.params
    }

    /// Set the median offset between peer clocks and ours, in seconds.
    pub fn set_time_offset(&mut self, offset: i64) {
        self.time_offset = offset;
    }

    pub fn adjusted_time(&self) -> i64 {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
        now + self.time_offset
    }

    // ---------------------------------------------------------------------
    // Queries

    pub fn head(&self) -> &StorableBlock {
        // The head is inserted before it is published and never pruned.
        &self.blocks[&self.head]
    }

    pub fn current_height(&self) -> u32 {
        self.head().height()
    }

    pub fn current_timestamp(&self) -> u32 {
        self.head().timestamp()
    }

    /// Lowest main-chain height still held in memory.
    pub fn base_height(&self) -> u32 {
        self.base_height
    }

    pub fn block_for_id(&self, hash: &BlockHash) -> Option<&StorableBlock> {
        self.blocks.get(hash)
    }

    pub fn block_at_height(&self, height: u32) -> Option<&StorableBlock> {
        self.main_chain.get(&height).and_then(|hash| self.blocks.get(hash))
    }

    /// Main-chain hashes in the window, lowest first.
    pub fn all_block_ids(&self) -> Vec<BlockHash> {
        self.main_chain.values().copied().collect()
    }

    pub fn is_on_main_chain(&self, hash: &BlockHash) -> bool {
        self.blocks.get(hash).is_some_and(|block| self.main_chain.get(&block.height()) == Some(hash))
    }

    pub fn location_of(&self, hash: &BlockHash) -> ChainLocation {
        if self.is_on_main_chain(hash) {
            ChainLocation::Main
        } else if self.blocks.contains_key(hash) {
            ChainLocation::Fork
        } else if self.orphans.contains(hash) {
            ChainLocation::Orphan
        } else {
            ChainLocation::None
        }
    }

    /// True if the parent of `header` is unknown.
    pub fn is_orphan_block(&self, header: &BlockHeader) -> bool {
        !self.blocks.contains_key(&header.prev_blockhash)
    }

    pub fn is_known_orphan(&self, hash: &BlockHash) -> bool {
        self.orphans.contains(hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// The first unknown ancestor of a pooled orphan.
    pub fn orphan_root(&self, hash: &BlockHash) -> Option<BlockHash> {
        self.orphans.missing_root(hash)
    }

    pub fn fork_tips(&self) -> Vec<&ChainTip> {
        self.fork_tips.tips()
    }

    pub fn current_locator(&self) -> BlockLocator {
        build_block_locator(
            self.current_height(),
            self.base_height,
            |height| self.main_chain.get(&height).copied(),
            self.params.checkpoints.below(self.base_height).map(Checkpoint::hash),
        )
    }

    /// Walk back from `fork_head` to the first block on the main chain.
    pub fn find_fork_base_from_head(&self, fork_head: &BlockHash) -> ChainResult<&StorableBlock> {
        let (ancestor, _) = self.fork_path(*fork_head, *fork_head)?;
        Ok(&self.blocks[&ancestor])
    }

    // ---------------------------------------------------------------------
    // Mutation

    pub fn add_checkpoint(&mut self, checkpoint: Checkpoint) {
        if let Some(block) = self.block_at_height(checkpoint.height) {
            if block.hash() != checkpoint.hash() {
                warn!(
                    "Checkpoint at height {} conflicts with main chain block {}",
                    checkpoint.height,
                    block.hash()
                );
            }
        }
        Arc::make_mut(&mut self.params).checkpoints.add(checkpoint);
    }

    /// Place a header (with the matched transactions of its block, if any).
    ///
    /// Known blocks are a no-op. Blocks with an unknown parent are pooled as
    /// orphans. Attaching a block attaches any orphans waiting for it.
    pub fn add_block(
        &mut self,
        header: BlockHeader,
        transactions: Option<Vec<Transaction>>,
    ) -> ChainResult<AddBlockOutcome> {
        let hash = header.block_hash();
        self.check_header(&header)?;

        match self.location_of(&hash) {
            ChainLocation::None => {}
            location => {
                trace!("Block {} already known ({:?})", hash, location);
                return Ok(AddBlockOutcome::unchanged(hash, location, self.blocks.get(&hash).cloned()));
            }
        }

        if !self.blocks.contains_key(&header.prev_blockhash) {
            self.orphans.add_orphan(header, transactions);
            return Ok(AddBlockOutcome {
                hash,
                location: ChainLocation::Orphan,
                block: None,
                connected_orphans: Vec::new(),
                events: Vec::new(),
                duplicate: false,
            });
        }

        let attached = self.attach(header, transactions)?;
        let mut outcome = AddBlockOutcome {
            hash,
            location: attached.location,
            block: Some(attached.block),
            connected_orphans: Vec::new(),
            events: vec![attached.event],
            duplicate: false,
        };

        let mut parents = vec![hash];
        while let Some(parent) = parents.pop() {
            for orphan in self.orphans.take_children(&parent) {
                let orphan_hash = orphan.hash();
                match self.attach(orphan.header, orphan.transactions) {
                    Ok(attached) => {
                        debug!("Connected orphan {} at height {}", orphan_hash, attached.block.height());
                        outcome.connected_orphans.push(attached.block);
                        outcome.events.push(attached.event);
                        parents.push(orphan_hash);
                    }
                    Err(e) => warn!("Dropping orphan {}: {}", orphan_hash, e),
                }
            }
        }

        Ok(outcome)
    }

    /// Drop blocks below `head.height - max_size`. Returns how many were removed.
    pub fn truncate(&mut self) -> usize {
        let head_height = self.current_height();
        if head_height <= self.config.max_size {
            return 0;
        }
        let cutoff = head_height - self.config.max_size;
        if cutoff <= self.base_height {
            return 0;
        }

        let before = self.blocks.len();
        self.blocks.retain(|_, block| block.height() >= cutoff);
        self.main_chain = self.main_chain.split_off(&cutoff);
        self.fork_tips.prune_below(cutoff);
        self.base_height = cutoff;

        let removed = before - self.blocks.len();
        debug!("Truncated {} blocks below height {}", removed, cutoff);
        removed
    }

    /// Rewind the main chain to `height`.
    ///
    /// Inside the window this drops everything above `height`. Below it the
    /// chain restarts from the last checkpoint at or below `height`. Forks and
    /// orphans are discarded either way. Returns the new head.
    pub fn rewind_to(&mut self, height: u32) -> &StorableBlock {
        self.orphans.clear();
        self.fork_tips.clear();

        if height >= self.current_height() {
            let head = self.head;
            self.blocks.retain(|hash, block| *hash == head || self.main_chain.get(&block.height()) == Some(hash));
        } else if height >= self.base_height {
            let above = self.main_chain.split_off(&(height + 1));
            for hash in above.values() {
                self.blocks.remove(hash);
            }
            let main: std::collections::HashSet<BlockHash> = self.main_chain.values().copied().collect();
            self.blocks.retain(|hash, _| main.contains(hash));
            self.head = self.main_chain[&height];
        } else {
            return self.reset_to_checkpoint(height);
        }

        info!("Chain rewound to height {} ({})", self.current_height(), self.head);
        self.head()
    }

    /// Restart the chain from the last checkpoint at or below `height`.
    ///
    /// Everything in memory is dropped; the peer time offset is kept.
    pub fn reset_to_checkpoint(&mut self, height: u32) -> &StorableBlock {
        let checkpoint = *self.params.checkpoints.last_at_or_below(height);
        let root = StorableBlock::root(checkpoint.header, checkpoint.height);
        let time_offset = self.time_offset;
        *self = Self::new(self.params.clone(), self.config.clone(), root);
        self.time_offset = time_offset;

        info!("Chain reset to checkpoint at height {} ({})", checkpoint.height, self.head);
        self.head()
    }

    pub fn remove_expired_orphans(&mut self) -> usize {
        self.orphans.remove_expired().len()
    }

    // ---------------------------------------------------------------------
    // Internals

    /// Checks that need no chain context.
    fn check_header(&self, header: &BlockHeader) -> Result<(), ValidationError> {
        check_proof_of_work(header, &self.params)?;

        let limit = self.adjusted_time() + self.config.allowed_time_drift.as_secs() as i64;
        if i64::from(header.time) > limit {
            return Err(ValidationError::InvalidBlock {
                hash: header.block_hash(),
                reason: format!("timestamp {} too far in the future (limit {})", header.time, limit),
            });
        }
        Ok(())
    }

    /// Checks that depend on the parent: checkpoints and difficulty.
    fn check_placement(&self, parent: &StorableBlock, header: &BlockHeader) -> Result<(), ValidationError> {
        let hash = header.block_hash();
        let height = parent.height() + 1;
        let invalid = |reason: String| ValidationError::InvalidBlock {
            hash,
            reason,
        };

        if let Some(checkpoint) = self.params.checkpoint_at_height(height) {
            if checkpoint.hash() != hash {
                return Err(invalid(format!("does not match checkpoint {} at height {}", checkpoint.hash(), height)));
            }
        }

        let params = &self.params;
        if params.no_retargeting {
            if header.bits != parent.header().bits {
                return Err(invalid("difficulty changed on a network without retargeting".to_string()));
            }
            return Ok(());
        }

        if !params.is_retarget_height(height) {
            if !params.allow_min_difficulty_blocks && header.bits != parent.header().bits {
                return Err(invalid(format!(
                    "bits {:#010x} differ from parent bits {:#010x} outside a retarget boundary",
                    header.bits.to_consensus(),
                    parent.header().bits.to_consensus()
                )));
            }
            return Ok(());
        }

        let first_height = height - params.retarget_interval();
        let Some(first) = self.ancestor_at(parent, first_height) else {
            debug!("Retarget check for height {} skipped: block {} not in window", height, first_height);
            return Ok(());
        };

        let expected = next_retarget_bits(params, parent.header(), first.timestamp());
        if header.bits != expected {
            return Err(invalid(format!(
                "bad retarget at height {}: bits {:#010x}, expected {:#010x}",
                height,
                header.bits.to_consensus(),
                expected.to_consensus()
            )));
        }
        Ok(())
    }

    /// The ancestor of `from` at `height`, following parent links.
    fn ancestor_at<'a>(&'a self, from: &'a StorableBlock, height: u32) -> Option<&'a StorableBlock> {
        let mut current = from;
        loop {
            if current.height() == height {
                return Some(current);
            }
            if current.height() < height {
                return None;
            }
            if self.is_on_main_chain(&current.hash()) {
                return self.block_at_height(height);
            }
            current = self.blocks.get(&current.prev_hash())?;
        }
    }

    /// Walk back from `start` to the main chain.
    ///
    /// Returns the ancestor hash and the side-branch hashes above it, lowest first.
    fn fork_path(&self, start: BlockHash, fork_tip: BlockHash) -> ChainResult<(BlockHash, Vec<BlockHash>)> {
        let mut path = Vec::new();
        let mut cursor = start;
        let mut steps = 0u32;

        loop {
            let Some(block) = self.blocks.get(&cursor) else {
                return Err(ChainError::ForkBaseNotFound {
                    fork_tip,
                    steps,
                });
            };
            if self.is_on_main_chain(&cursor) {
                path.reverse();
                return Ok((cursor, path));
            }
            steps += 1;
            if steps > self.config.max_step {
                return Err(ChainError::ForkBaseNotFound {
                    fork_tip,
                    steps,
                });
            }
            path.push(cursor);
            cursor = block.prev_hash();
        }
    }

    /// Validate and place a block whose parent is in the arena.
    fn attach(&mut self, header: BlockHeader, transactions: Option<Vec<Transaction>>) -> ChainResult<Attached> {
        let Some(parent) = self.blocks.get(&header.prev_blockhash) else {
            return Err(ChainError::ForkBaseNotFound {
                fork_tip: header.block_hash(),
                steps: 0,
            });
        };
        self.check_placement(parent, &header)?;
        let block = parent.build_next(header, transactions);
        let hash = block.hash();

        if block.prev_hash() == self.head {
            self.main_chain.insert(block.height(), hash);
            self.blocks.insert(hash, block.clone());
            self.head = hash;
            trace!("Extended main chain to {} at height {}", hash, block.height());
            return Ok(Attached {
                event: ChainEvent::BlockAdded {
                    block: block.clone(),
                    location: ChainLocation::Main,
                },
                block,
                location: ChainLocation::Main,
            });
        }

        if !block.has_more_work_than(self.head()) {
            self.blocks.insert(hash, block.clone());
            self.fork_tips.extend(&block);
            debug!("Stored fork block {} at height {}", hash, block.height());
            return Ok(Attached {
                event: ChainEvent::BlockAdded {
                    block: block.clone(),
                    location: ChainLocation::Fork,
                },
                block,
                location: ChainLocation::Fork,
            });
        }

        // Heavier side branch: everything is computed before the first write.
        let (ancestor_hash, mut branch) = self.fork_path(block.prev_hash(), hash)?;
        let ancestor = self.blocks[&ancestor_hash].clone();
        let old_blocks: Vec<StorableBlock> = self
            .main_chain
            .range(ancestor.height() + 1..)
            .rev()
            .filter_map(|(_, h)| self.blocks.get(h).cloned())
            .collect();
        let old_head = self.head().clone();

        self.blocks.insert(hash, block.clone());
        branch.push(hash);
        let _displaced = self.main_chain.split_off(&(ancestor.height() + 1));
        let mut new_blocks = Vec::with_capacity(branch.len());
        for branch_hash in &branch {
            let branch_block = &self.blocks[branch_hash];
            self.main_chain.insert(branch_block.height(), *branch_hash);
            self.fork_tips.remove(branch_hash);
            new_blocks.push(branch_block.clone());
        }
        self.fork_tips.extend(&old_head);
        self.head = hash;

        info!(
            "Reorganized at {} (height {}): {} blocks out, {} blocks in, new head {}",
            ancestor.hash(),
            ancestor.height(),
            old_blocks.len(),
            new_blocks.len(),
            hash
        );

        Ok(Attached {
            event: ChainEvent::Reorganized(ReorgEvent {
                ancestor,
                old_blocks,
                new_blocks,
            }),
            block,
            location: ChainLocation::Main,
        })
    }
}
