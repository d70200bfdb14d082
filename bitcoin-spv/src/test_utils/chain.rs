use bitcoin::absolute::LockTime;
use bitcoin::block::Header as BlockHeader;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, CompactTarget, OutPoint, PubkeyHash, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode, TxOut,
    Txid, Witness,
};

use crate::chain::difficulty::check_proof_of_work;
use crate::chain::{ChainState, ChainStateConfig, StorableBlock};
use crate::params::NetworkParams;

/// Seconds between consecutive test headers.
pub const TEST_BLOCK_SPACING: u32 = 600;

/// Increment the nonce until `header` satisfies its own bits.
pub fn mine(params: &NetworkParams, mut header: BlockHeader) -> BlockHeader {
    while check_proof_of_work(&header, params).is_err() {
        header.nonce = header.nonce.wrapping_add(1);
    }
    header
}

/// A mined child of `parent` with the same bits. `salt` tells sibling
/// branches apart.
pub fn next_header(params: &NetworkParams, parent: &BlockHeader, salt: u32) -> BlockHeader {
    next_header_with(params, parent, salt, parent.time + TEST_BLOCK_SPACING, parent.bits)
}

pub fn next_header_with(
    params: &NetworkParams,
    parent: &BlockHeader,
    salt: u32,
    time: u32,
    bits: CompactTarget,
) -> BlockHeader {
    let mut root = [0u8; 32];
    root[..4].copy_from_slice(&salt.to_le_bytes());
    let header = BlockHeader {
        version: parent.version,
        prev_blockhash: parent.block_hash(),
        merkle_root: TxMerkleNode::from_byte_array(root),
        time,
        bits,
        nonce: 0,
    };
    mine(params, header)
}

/// `count` mined headers on top of `parent`, lowest first.
pub fn build_headers(params: &NetworkParams, parent: &BlockHeader, count: usize, salt: u32) -> Vec<BlockHeader> {
    let mut headers = Vec::with_capacity(count);
    let mut tip = *parent;
    for _ in 0..count {
        tip = next_header(params, &tip, salt);
        headers.push(tip);
    }
    headers
}

impl StorableBlock {
    /// Regtest block at `height` with a unique, unvalidated header.
    pub fn dummy(height: u32) -> StorableBlock {
        let mut header = NetworkParams::regtest().genesis;
        header.nonce = height;
        StorableBlock::root(header, height)
    }
}

impl ChainState {
    /// Regtest chain from genesis with `len` mined blocks on top.
    pub fn dummy(len: usize) -> (ChainState, Vec<BlockHeader>) {
        let params = NetworkParams::regtest();
        let headers = build_headers(&params, &params.genesis, len, 0);
        let mut chain = ChainState::from_genesis(params.into(), ChainStateConfig::default());
        for header in &headers {
            if let Err(e) = chain.add_block(*header, None) {
                panic!("dummy chain rejected its own header: {}", e);
            }
        }
        (chain, headers)
    }
}

/// A transaction unique to `(index, salt)` paying nobody we watch.
pub fn filler_tx(index: usize, salt: u32) -> Transaction {
    let mut script = vec![0x6a, 0x08];
    script.extend_from_slice(&(index as u32).to_le_bytes());
    script.extend_from_slice(&salt.to_le_bytes());
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn::default()],
        output: vec![TxOut {
            value: Amount::from_sat(50 * 100_000_000),
            script_pubkey: ScriptBuf::from_bytes(script),
        }],
    }
}

/// A P2PKH payment of `value` to `pubkey_hash`, spending an outpoint derived from `salt`.
pub fn payment_tx(pubkey_hash: [u8; 20], value: u64, salt: u32) -> Transaction {
    let mut txid = [0u8; 32];
    txid[..4].copy_from_slice(&salt.to_le_bytes());
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array(txid),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(pubkey_hash)),
        }],
    }
}

/// `count` mined blocks on top of `parent`, lowest first.
///
/// Block `i` holds a filler transaction followed by `transactions(i)`.
pub fn build_blocks(
    params: &NetworkParams,
    parent: &BlockHeader,
    count: usize,
    salt: u32,
    mut transactions: impl FnMut(usize) -> Vec<Transaction>,
) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(count);
    let mut tip = *parent;
    for i in 0..count {
        let mut txdata = vec![filler_tx(i, salt)];
        txdata.extend(transactions(i));
        let mut block = Block {
            header: BlockHeader {
                version: tip.version,
                prev_blockhash: tip.block_hash(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: tip.time + TEST_BLOCK_SPACING,
                bits: tip.bits,
                nonce: 0,
            },
            txdata,
        };
        if let Some(root) = block.compute_merkle_root() {
            block.header.merkle_root = root;
        }
        block.header = mine(params, block.header);
        tip = block.header;
        blocks.push(block);
    }
    blocks
}
