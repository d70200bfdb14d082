//! Tests for block placement, validation and window maintenance

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bitcoin::CompactTarget;

    use crate::chain::difficulty::next_retarget_bits;
    use crate::chain::{ChainLocation, ChainState, ChainStateConfig, Checkpoint};
    use crate::error::{ChainError, ValidationError};
    use crate::params::NetworkParams;
    use crate::storage::{BlockStore, MemoryBlockStore};
    use crate::test_utils::{build_headers, mine, next_header, next_header_with};

    fn regtest_chain() -> (Arc<NetworkParams>, ChainState) {
        let params = Arc::new(NetworkParams::regtest());
        let chain = ChainState::from_genesis(params.clone(), ChainStateConfig::default());
        (params, chain)
    }

    #[test]
    fn test_sequential_blocks_extend_main_chain() {
        let (params, mut chain) = regtest_chain();
        let headers = build_headers(&params, &params.genesis, 5, 0);

        for (i, header) in headers.iter().enumerate() {
            let outcome = chain.add_block(*header, None).unwrap();
            assert_eq!(outcome.location, ChainLocation::Main);
            assert!(!outcome.duplicate);
            assert_eq!(outcome.block.as_ref().unwrap().height(), i as u32 + 1);
        }

        assert_eq!(chain.current_height(), 5);
        assert_eq!(chain.head().hash(), headers[4].block_hash());
        assert_eq!(chain.block_at_height(3).unwrap().hash(), headers[2].block_hash());
        assert_eq!(chain.all_block_ids().len(), 6);
        assert!(chain.head().work() > chain.block_at_height(4).unwrap().work());
    }

    #[test]
    fn test_duplicate_block_is_noop() {
        let (params, mut chain) = regtest_chain();
        let headers = build_headers(&params, &params.genesis, 2, 0);
        chain.add_block(headers[0], None).unwrap();
        chain.add_block(headers[1], None).unwrap();

        let outcome = chain.add_block(headers[0], None).unwrap();
        assert!(outcome.duplicate);
        assert_eq!(outcome.location, ChainLocation::Main);
        assert!(outcome.events.is_empty());
        assert_eq!(chain.current_height(), 2);
    }

    #[test]
    fn test_orphan_connects_when_parent_arrives() {
        let (params, mut chain) = regtest_chain();
        let headers = build_headers(&params, &params.genesis, 3, 0);

        let outcome = chain.add_block(headers[2], None).unwrap();
        assert_eq!(outcome.location, ChainLocation::Orphan);
        let outcome = chain.add_block(headers[1], None).unwrap();
        assert_eq!(outcome.location, ChainLocation::Orphan);
        assert_eq!(chain.orphan_count(), 2);
        assert_eq!(chain.orphan_root(&headers[2].block_hash()), Some(headers[0].block_hash()));
        assert!(chain.is_orphan_block(&headers[1]));
        assert!(!chain.is_orphan_block(&headers[0]));

        let outcome = chain.add_block(headers[0], None).unwrap();
        assert_eq!(outcome.location, ChainLocation::Main);
        let connected: Vec<_> = outcome.connected_orphans.iter().map(|b| b.hash()).collect();
        assert_eq!(connected, vec![headers[1].block_hash(), headers[2].block_hash()]);
        assert_eq!(outcome.events.len(), 3);
        assert_eq!(chain.orphan_count(), 0);
        assert_eq!(chain.current_height(), 3);
    }

    #[test]
    fn test_bad_proof_of_work_rejected_without_mutation() {
        let (params, mut chain) = regtest_chain();
        let mut header = next_header(&params, &params.genesis, 0);
        // Find a nonce that misses the target.
        while crate::chain::difficulty::check_proof_of_work(&header, &params).is_ok() {
            header.nonce += 1;
        }

        let err = chain.add_block(header, None).unwrap_err();
        assert!(matches!(err, ChainError::Validation(ValidationError::Malformed { .. })));
        assert_eq!(chain.current_height(), 0);
        assert_eq!(chain.location_of(&header.block_hash()), ChainLocation::None);
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let (params, mut chain) = regtest_chain();
        let far_future = (chain.adjusted_time() + 3 * 60 * 60) as u32;
        let header = next_header_with(&params, &params.genesis, 0, far_future, params.genesis.bits);

        let err = chain.add_block(header, None).unwrap_err();
        assert!(matches!(err, ChainError::Validation(ValidationError::InvalidBlock { .. })));

        // Within the allowed drift is fine.
        let near_future = (chain.adjusted_time() + 60 * 60) as u32;
        let header = next_header_with(&params, &params.genesis, 1, near_future, params.genesis.bits);
        assert_eq!(chain.add_block(header, None).unwrap().location, ChainLocation::Main);
    }

    #[test]
    fn test_bits_change_rejected_without_retargeting() {
        let (params, mut chain) = regtest_chain();
        let header = next_header_with(
            &params,
            &params.genesis,
            0,
            params.genesis.time + 600,
            CompactTarget::from_consensus(0x207ffffe),
        );
        let err = chain.add_block(header, None).unwrap_err();
        assert!(matches!(err, ChainError::Validation(ValidationError::InvalidBlock { .. })));
    }

    fn retargeting_params() -> Arc<NetworkParams> {
        let mut params = NetworkParams::regtest().with_retarget(600, 60);
        params.no_retargeting = false;
        params.allow_min_difficulty_blocks = false;
        Arc::new(params)
    }

    /// Nine fast blocks on top of genesis, so height 10 is a retarget boundary.
    fn fast_interval(params: &NetworkParams, chain: &mut ChainState) -> bitcoin::block::Header {
        let mut tip = params.genesis;
        for i in 0..9 {
            tip = next_header_with(params, &tip, i, tip.time + 30, tip.bits);
            chain.add_block(tip, None).unwrap();
        }
        tip
    }

    #[test]
    fn test_retarget_boundary_accepts_expected_bits() {
        let params = retargeting_params();
        let mut chain = ChainState::from_genesis(params.clone(), ChainStateConfig::default());
        let tip = fast_interval(&params, &mut chain);

        let expected = next_retarget_bits(&params, &tip, params.genesis.time);
        assert_ne!(expected, tip.bits);
        let header = next_header_with(&params, &tip, 99, tip.time + 30, expected);

        let outcome = chain.add_block(header, None).unwrap();
        assert_eq!(outcome.location, ChainLocation::Main);
        assert_eq!(chain.current_height(), 10);
    }

    #[test]
    fn test_retarget_boundary_rejects_stale_bits() {
        let params = retargeting_params();
        let mut chain = ChainState::from_genesis(params.clone(), ChainStateConfig::default());
        let tip = fast_interval(&params, &mut chain);

        let header = next_header_with(&params, &tip, 99, tip.time + 30, tip.bits);
        let err = chain.add_block(header, None).unwrap_err();
        assert!(matches!(err, ChainError::Validation(ValidationError::InvalidBlock { .. })));
        assert_eq!(chain.current_height(), 9);
    }

    #[test]
    fn test_checkpoint_mismatch_rejected() {
        let params = NetworkParams::regtest();
        let good = build_headers(&params, &params.genesis, 2, 0);
        let params = Arc::new(params.with_checkpoint(Checkpoint::new(2, good[1])));
        let mut chain = ChainState::from_genesis(params.clone(), ChainStateConfig::default());

        chain.add_block(good[0], None).unwrap();
        let rogue = next_header(&params, &good[0], 7);
        let err = chain.add_block(rogue, None).unwrap_err();
        assert!(matches!(err, ChainError::Validation(ValidationError::InvalidBlock { .. })));
        assert_eq!(chain.add_block(good[1], None).unwrap().location, ChainLocation::Main);
    }

    #[test]
    fn test_truncate_keeps_max_size_window() {
        let params = Arc::new(NetworkParams::regtest());
        let config = ChainStateConfig {
            max_size: 5,
            ..ChainStateConfig::default()
        };
        let mut chain = ChainState::from_genesis(params.clone(), config);
        for header in build_headers(&params, &params.genesis, 12, 0) {
            chain.add_block(header, None).unwrap();
        }

        let removed = chain.truncate();
        assert_eq!(removed, 7);
        assert_eq!(chain.base_height(), 7);
        assert_eq!(chain.all_block_ids().len(), 6);
        assert!(chain.block_at_height(6).is_none());
        assert_eq!(chain.current_height(), 12);

        // Nothing more to drop.
        assert_eq!(chain.truncate(), 0);
    }

    #[test]
    fn test_locator_is_deterministic_and_ends_at_genesis() {
        let (chain, headers) = ChainState::dummy(30);
        let first = chain.current_locator();
        let second = chain.current_locator();

        assert_eq!(first, second);
        assert_eq!(first.tip(), Some(headers[29].block_hash()));
        assert_eq!(first.hashes().last(), Some(&chain.params().genesis_hash()));
        assert!(first.len() > 10);
        assert_eq!(first.hashes()[9], headers[20].block_hash());
    }

    #[test]
    fn test_locator_after_truncate_uses_checkpoints() {
        let params = Arc::new(NetworkParams::regtest());
        let config = ChainStateConfig {
            max_size: 4,
            ..ChainStateConfig::default()
        };
        let mut chain = ChainState::from_genesis(params.clone(), config);
        for header in build_headers(&params, &params.genesis, 10, 0) {
            chain.add_block(header, None).unwrap();
        }
        chain.truncate();

        let locator = chain.current_locator();
        assert_eq!(locator.len(), 6);
        assert_eq!(locator.hashes()[4], chain.block_at_height(6).unwrap().hash());
        assert_eq!(locator.hashes()[5], params.genesis_hash());
    }

    #[test]
    fn test_rewind_within_window() {
        let (mut chain, headers) = ChainState::dummy(8);
        let head = chain.rewind_to(3).clone();

        assert_eq!(head.hash(), headers[2].block_hash());
        assert_eq!(chain.current_height(), 3);
        assert!(chain.block_for_id(&headers[5].block_hash()).is_none());

        // The removed blocks attach again.
        for header in &headers[3..] {
            assert_eq!(chain.add_block(*header, None).unwrap().location, ChainLocation::Main);
        }
        assert_eq!(chain.current_height(), 8);
    }

    #[test]
    fn test_rewind_below_window_restarts_from_checkpoint() {
        let params = Arc::new(NetworkParams::regtest());
        let config = ChainStateConfig {
            max_size: 3,
            ..ChainStateConfig::default()
        };
        let mut chain = ChainState::from_genesis(params.clone(), config);
        for header in build_headers(&params, &params.genesis, 8, 0) {
            chain.add_block(header, None).unwrap();
        }
        chain.truncate();
        assert_eq!(chain.base_height(), 5);

        chain.rewind_to(2);
        assert_eq!(chain.current_height(), 0);
        assert_eq!(chain.head().hash(), params.genesis_hash());
    }

    #[test]
    fn test_reset_to_checkpoint_keeps_time_offset() {
        let params = NetworkParams::regtest();
        let headers = build_headers(&params, &params.genesis, 6, 0);
        let params = Arc::new(params.with_checkpoint(Checkpoint::new(4, headers[3])));
        let mut chain = ChainState::from_genesis(params, ChainStateConfig::default());
        for header in &headers {
            chain.add_block(*header, None).unwrap();
        }
        chain.set_time_offset(30);
        let adjusted = chain.adjusted_time();

        let head = chain.reset_to_checkpoint(5).clone();
        assert_eq!(head.hash(), headers[3].block_hash());
        assert_eq!(chain.current_height(), 4);
        assert_eq!(chain.all_block_ids(), vec![headers[3].block_hash()]);
        assert!(chain.adjusted_time() >= adjusted);

        assert_eq!(chain.add_block(headers[4], None).unwrap().location, ChainLocation::Main);
    }

    #[test]
    fn test_flush_then_load_restores_head() {
        let (chain, headers) = ChainState::dummy(6);
        let mut store = MemoryBlockStore::new();
        chain.flush(&mut store).unwrap();
        assert_eq!(store.head().unwrap().unwrap().hash(), headers[5].block_hash());
        assert_eq!(store.len(), 7);

        let params = chain.params().clone();
        let loaded = ChainState::load(params, ChainStateConfig::default(), &mut store, None).unwrap();
        assert_eq!(loaded.current_height(), 6);
        assert_eq!(loaded.head().work(), chain.head().work());
        assert_eq!(loaded.all_block_ids(), chain.all_block_ids());
    }

    #[test]
    fn test_load_empty_store_bootstraps_from_checkpoint() {
        let params = NetworkParams::regtest();
        let anchor = mine(&params, build_headers(&params, &params.genesis, 1, 0)[0]);
        let params = Arc::new(params.with_checkpoint(Checkpoint::new(1, anchor)));
        let mut store = MemoryBlockStore::new();

        let chain =
            ChainState::load(params.clone(), ChainStateConfig::default(), &mut store, Some(u32::MAX)).unwrap();
        assert_eq!(chain.current_height(), 1);
        assert_eq!(chain.head().hash(), anchor.block_hash());
        assert_eq!(store.head().unwrap().unwrap().hash(), anchor.block_hash());

        let mut store = MemoryBlockStore::new();
        let chain = ChainState::load(params, ChainStateConfig::default(), &mut store, None).unwrap();
        assert_eq!(chain.current_height(), 0);
    }

    #[test]
    fn test_load_window_is_bounded_by_max_size() {
        let (chain, _) = ChainState::dummy(10);
        let mut store = MemoryBlockStore::new();
        chain.flush(&mut store).unwrap();

        let config = ChainStateConfig {
            max_size: 4,
            ..ChainStateConfig::default()
        };
        let loaded = ChainState::load(chain.params().clone(), config, &mut store, None).unwrap();
        assert_eq!(loaded.current_height(), 10);
        assert_eq!(loaded.base_height(), 6);
    }
}
