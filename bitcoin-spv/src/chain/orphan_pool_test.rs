//! Tests for orphan pool bookkeeping

#[cfg(test)]
mod tests {
    use super::super::orphan_pool::*;
    use bitcoin::block::Header as BlockHeader;
    use bitcoin::hashes::Hash;
    use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
    use std::thread;
    use std::time::Duration;

    fn header(prev: BlockHash, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: bitcoin::block::Version::ONE,
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_296_688_602 + nonce,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce,
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut pool = OrphanPool::new();
        let h = header(BlockHash::from_byte_array([1; 32]), 1);
        assert!(pool.add_orphan(h, None));
        assert!(!pool.add_orphan(h, None));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&h.block_hash()));
    }

    #[test]
    fn test_take_children_removes_all_indexes() {
        let mut pool = OrphanPool::new();
        let parent = BlockHash::from_byte_array([9; 32]);
        let a = header(parent, 1);
        let b = header(parent, 2);
        let unrelated = header(BlockHash::from_byte_array([3; 32]), 3);
        pool.add_orphan(a, None);
        pool.add_orphan(b, None);
        pool.add_orphan(unrelated, None);

        let children = pool.take_children(&parent);
        let hashes: Vec<BlockHash> = children.iter().map(|o| o.hash()).collect();
        assert_eq!(hashes, vec![a.block_hash(), b.block_hash()]);
        assert_eq!(pool.len(), 1);
        assert!(pool.take_children(&parent).is_empty());
        assert!(pool.contains(&unrelated.block_hash()));
    }

    #[test]
    fn test_size_limit_evicts_oldest() {
        let mut pool = OrphanPool::with_config(3, Duration::from_secs(60));
        let headers: Vec<BlockHeader> =
            (0..5u8).map(|i| header(BlockHash::from_byte_array([i + 10; 32]), i as u32)).collect();
        for h in &headers {
            pool.add_orphan(*h, None);
        }

        assert_eq!(pool.len(), 3);
        assert!(!pool.contains(&headers[0].block_hash()));
        assert!(!pool.contains(&headers[1].block_hash()));
        for h in &headers[2..] {
            assert!(pool.contains(&h.block_hash()));
        }
        // evicted entries left no dangling prev index
        assert!(pool.take_children(&headers[0].prev_blockhash).is_empty());
    }

    #[test]
    fn test_expiration() {
        let mut pool = OrphanPool::with_config(10, Duration::from_millis(50));
        let old = header(BlockHash::from_byte_array([1; 32]), 1);
        pool.add_orphan(old, None);
        thread::sleep(Duration::from_millis(80));
        let fresh = header(BlockHash::from_byte_array([2; 32]), 2);
        pool.add_orphan(fresh, None);

        let removed = pool.remove_expired();
        assert_eq!(removed, vec![old.block_hash()]);
        assert!(pool.contains(&fresh.block_hash()));
    }

    #[test]
    fn test_missing_root_follows_orphan_chain() {
        let mut pool = OrphanPool::new();
        let missing = BlockHash::from_byte_array([42; 32]);
        let first = header(missing, 1);
        let second = header(first.block_hash(), 2);
        let third = header(second.block_hash(), 3);
        pool.add_orphan(third, None);
        pool.add_orphan(first, None);
        pool.add_orphan(second, None);

        assert_eq!(pool.missing_root(&third.block_hash()), Some(missing));
        assert_eq!(pool.missing_root(&BlockHash::all_zeros()), None);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut pool = OrphanPool::new();
        let parent = BlockHash::from_byte_array([5; 32]);
        let a = header(parent, 1);
        let b = header(parent, 2);
        pool.add_orphan(a, None);
        pool.add_orphan(b, None);

        let removed = pool.remove_orphan(&a.block_hash()).unwrap();
        assert_eq!(removed.header, a);
        assert_eq!(pool.take_children(&parent).len(), 1);

        pool.add_orphan(a, None);
        pool.clear();
        assert!(pool.is_empty());
        assert!(pool.get(&a.block_hash()).is_none());
    }
}
