use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bitcoin::block::Header as BlockHeader;
use bitcoin::{BlockHash, Transaction};
use tracing::{debug, trace};

/// Maximum number of orphan blocks to keep in memory
pub const MAX_ORPHAN_BLOCKS: usize = 100;

/// Maximum time to keep an orphan block before eviction
pub const ORPHAN_TIMEOUT: Duration = Duration::from_secs(900);

/// A block whose parent has not been seen yet.
#[derive(Debug, Clone)]
pub struct OrphanBlock {
    pub header: BlockHeader,
    pub transactions: Option<Vec<Transaction>>,
    pub received_at: Instant,
}

impl OrphanBlock {
    pub fn hash(&self) -> BlockHash {
        self.header.block_hash()
    }
}

/// Orphans indexed by their own hash and by the hash they are waiting for.
///
/// Orphans never count towards height or work. They leave the pool when
/// their parent arrives, when they expire, or when the pool is full.
#[derive(Debug)]
pub struct OrphanPool {
    by_hash: HashMap<BlockHash, OrphanBlock>,
    /// prev hash -> children waiting for it
    by_prev: HashMap<BlockHash, Vec<BlockHash>>,
    /// insertion order, oldest first
    eviction_queue: VecDeque<BlockHash>,
    max_orphans: usize,
    orphan_timeout: Duration,
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new()
    }
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::with_config(MAX_ORPHAN_BLOCKS, ORPHAN_TIMEOUT)
    }

    pub fn with_config(max_orphans: usize, orphan_timeout: Duration) -> Self {
        Self {
            by_hash: HashMap::new(),
            by_prev: HashMap::new(),
            eviction_queue: VecDeque::new(),
            max_orphans: max_orphans.max(1),
            orphan_timeout,
        }
    }

    /// Returns false if the block was already pooled.
    pub fn add_orphan(&mut self, header: BlockHeader, transactions: Option<Vec<Transaction>>) -> bool {
        let hash = header.block_hash();
        if self.by_hash.contains_key(&hash) {
            trace!("Orphan block {} already in pool", hash);
            return false;
        }

        while self.by_hash.len() >= self.max_orphans {
            let Some(oldest) = self.eviction_queue.front().copied() else {
                break;
            };
            self.remove_orphan(&oldest);
            debug!("Evicted oldest orphan {} due to size limit", oldest);
        }

        self.by_prev.entry(header.prev_blockhash).or_default().push(hash);
        self.by_hash.insert(
            hash,
            OrphanBlock {
                header,
                transactions,
                received_at: Instant::now(),
            },
        );
        self.eviction_queue.push_back(hash);

        debug!("Added orphan block {} (prev: {})", hash, header.prev_blockhash);
        true
    }

    /// Remove and return every orphan waiting for `prev_hash`, in arrival order.
    pub fn take_children(&mut self, prev_hash: &BlockHash) -> Vec<OrphanBlock> {
        let Some(children) = self.by_prev.remove(prev_hash) else {
            return Vec::new();
        };

        children
            .into_iter()
            .filter_map(|hash| {
                self.eviction_queue.retain(|h| *h != hash);
                self.by_hash.remove(&hash)
            })
            .collect()
    }

    pub fn remove_orphan(&mut self, hash: &BlockHash) -> Option<OrphanBlock> {
        let orphan = self.by_hash.remove(hash)?;

        let prev = orphan.header.prev_blockhash;
        if let Some(siblings) = self.by_prev.get_mut(&prev) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_prev.remove(&prev);
            }
        }
        self.eviction_queue.retain(|h| h != hash);

        trace!("Removed orphan block {}", hash);
        Some(orphan)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&OrphanBlock> {
        self.by_hash.get(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn remove_expired(&mut self) -> Vec<BlockHash> {
        let now = Instant::now();
        let expired: Vec<BlockHash> = self
            .by_hash
            .iter()
            .filter(|(_, orphan)| now.duration_since(orphan.received_at) > self.orphan_timeout)
            .map(|(hash, _)| *hash)
            .collect();

        for hash in &expired {
            self.remove_orphan(hash);
            debug!("Removed expired orphan {}", hash);
        }
        expired
    }

    /// Walk `prev` links inside the pool up to the first missing ancestor.
    ///
    /// That hash is what to request from peers to connect the orphan chain.
    pub fn missing_root(&self, hash: &BlockHash) -> Option<BlockHash> {
        let mut current = self.by_hash.get(hash)?;
        while let Some(parent) = self.by_hash.get(&current.header.prev_blockhash) {
            current = parent;
        }
        Some(current.header.prev_blockhash)
    }

    pub fn clear(&mut self) {
        self.by_hash.clear();
        self.by_prev.clear();
        self.eviction_queue.clear();
    }
}
