//! Tests for side branches and chain reorganization

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bitcoin::absolute::LockTime;
    use bitcoin::block::Header as BlockHeader;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, Transaction, TxOut};

    use crate::chain::{ChainEvent, ChainLocation, ChainState, ChainStateConfig};
    use crate::error::ChainError;
    use crate::params::NetworkParams;
    use crate::test_utils::build_headers;

    fn tx(value: u64) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    /// Main chain A1..A5 and a side branch B3..B6 forking off A2.
    fn two_branches(config: ChainStateConfig) -> (ChainState, Vec<BlockHeader>, Vec<BlockHeader>) {
        let params = Arc::new(NetworkParams::regtest());
        let mut chain = ChainState::from_genesis(params.clone(), config);
        let a = build_headers(&params, &params.genesis, 5, 1);
        let b = build_headers(&params, &a[1], 4, 2);

        for (i, header) in a.iter().enumerate() {
            let txs = (i == 3).then(|| vec![tx(4)]);
            chain.add_block(*header, txs).unwrap();
        }
        (chain, a, b)
    }

    #[test]
    fn test_equal_work_branch_stays_a_fork() {
        let (mut chain, a, b) = two_branches(ChainStateConfig::default());

        for header in &b[..3] {
            let outcome = chain.add_block(*header, None).unwrap();
            assert_eq!(outcome.location, ChainLocation::Fork);
            assert!(outcome.reorganization().is_none());
        }

        // B5 carries exactly as much work as A5; the head does not move.
        assert_eq!(chain.head().hash(), a[4].block_hash());
        assert_eq!(chain.location_of(&b[2].block_hash()), ChainLocation::Fork);
        assert_eq!(chain.fork_tips().len(), 1);
        assert_eq!(chain.fork_tips()[0].hash, b[2].block_hash());

        let base = chain.find_fork_base_from_head(&b[2].block_hash()).unwrap();
        assert_eq!(base.hash(), a[1].block_hash());
        assert_eq!(base.height(), 2);
    }

    #[test]
    fn test_heavier_branch_reorganizes() {
        let (mut chain, a, b) = two_branches(ChainStateConfig::default());
        for (i, header) in b[..3].iter().enumerate() {
            let txs = (i == 1).then(|| vec![tx(40)]);
            chain.add_block(*header, txs).unwrap();
        }

        let outcome = chain.add_block(b[3], None).unwrap();
        assert_eq!(outcome.location, ChainLocation::Main);
        let reorg = outcome.reorganization().expect("reorganization expected");

        assert_eq!(reorg.ancestor.hash(), a[1].block_hash());
        assert_eq!(reorg.old_hashes(), vec![a[4].block_hash(), a[3].block_hash(), a[2].block_hash()]);
        assert_eq!(
            reorg.new_hashes(),
            vec![b[0].block_hash(), b[1].block_hash(), b[2].block_hash(), b[3].block_hash()]
        );
        assert_eq!(reorg.depth(), 3);
        assert_eq!(reorg.new_head().unwrap().height(), 6);

        let disconnected: Vec<_> = reorg.disconnected_transactions().map(|t| t.output[0].value).collect();
        let connected: Vec<_> = reorg.connected_transactions().map(|t| t.output[0].value).collect();
        assert_eq!(disconnected, vec![Amount::from_sat(4)]);
        assert_eq!(connected, vec![Amount::from_sat(40)]);

        assert_eq!(chain.head().hash(), b[3].block_hash());
        assert_eq!(chain.current_height(), 6);
        assert_eq!(chain.block_at_height(3).unwrap().hash(), b[0].block_hash());
        assert!(chain.is_on_main_chain(&a[1].block_hash()));
        assert_eq!(chain.location_of(&a[4].block_hash()), ChainLocation::Fork);

        // The displaced branch is tracked as a fork tip.
        let tips: Vec<_> = chain.fork_tips().iter().map(|tip| tip.hash).collect();
        assert_eq!(tips, vec![a[4].block_hash()]);
    }

    #[test]
    fn test_reorg_back_to_original_branch() {
        let (mut chain, a, b) = two_branches(ChainStateConfig::default());
        for header in &b {
            chain.add_block(*header, None).unwrap();
        }
        let params = chain.params().clone();
        let a_more = build_headers(&params, &a[4], 2, 1);

        chain.add_block(a_more[0], None).unwrap();
        assert_eq!(chain.head().hash(), b[3].block_hash());

        let outcome = chain.add_block(a_more[1], None).unwrap();
        let reorg = outcome.reorganization().expect("reorganization expected");
        assert_eq!(reorg.depth(), 4);
        assert_eq!(reorg.new_blocks.len(), 5);
        assert_eq!(chain.current_height(), 7);
        assert_eq!(chain.head().hash(), a_more[1].block_hash());
    }

    #[test]
    fn test_reorg_through_orphan_connection() {
        let (mut chain, a, b) = two_branches(ChainStateConfig::default());

        // The side branch arrives top-down; nothing attaches until B3.
        for header in b.iter().rev().take(3) {
            assert_eq!(chain.add_block(*header, None).unwrap().location, ChainLocation::Orphan);
        }
        let outcome = chain.add_block(b[0], None).unwrap();

        assert_eq!(outcome.location, ChainLocation::Fork);
        assert_eq!(outcome.connected_orphans.len(), 3);
        let reorgs: Vec<_> = outcome
            .events
            .iter()
            .filter(|event| matches!(event, ChainEvent::Reorganized(_)))
            .collect();
        assert_eq!(reorgs.len(), 1);
        assert_eq!(chain.head().hash(), b[3].block_hash());
        assert!(!chain.is_on_main_chain(&a[2].block_hash()));
    }

    #[test]
    fn test_fork_base_beyond_max_step_leaves_state_untouched() {
        let config = ChainStateConfig {
            max_step: 2,
            ..ChainStateConfig::default()
        };
        let (mut chain, a, b) = two_branches(config);
        for header in &b[..3] {
            chain.add_block(*header, None).unwrap();
        }
        let ids_before = chain.all_block_ids();

        let err = chain.add_block(b[3], None).unwrap_err();
        match err {
            ChainError::ForkBaseNotFound {
                fork_tip,
                steps,
            } => {
                assert_eq!(fork_tip, b[3].block_hash());
                assert_eq!(steps, 3);
            }
            other => panic!("unexpected error: {}", other),
        }

        assert_eq!(chain.head().hash(), a[4].block_hash());
        assert_eq!(chain.all_block_ids(), ids_before);
        assert_eq!(chain.location_of(&b[3].block_hash()), ChainLocation::None);
    }
}
