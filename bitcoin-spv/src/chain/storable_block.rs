use bitcoin::block::Header as BlockHeader;
use bitcoin::{BlockHash, Transaction};

use crate::chain::chain_work::ChainWork;
use crate::params::NetworkParams;

/// A header placed in the chain: height and cumulative work are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorableBlock {
    header: BlockHeader,
    hash: BlockHash,
    /// Matched transactions of a filtered or full block, in block order.
    transactions: Option<Vec<Transaction>>,
    height: u32,
    work: ChainWork,
}

impl StorableBlock {
    /// The hash is always computed from `header`, never supplied.
    pub fn new(
        header: BlockHeader,
        transactions: Option<Vec<Transaction>>,
        height: u32,
        work: ChainWork,
    ) -> Self {
        Self {
            hash: header.block_hash(),
            header,
            transactions,
            height,
            work,
        }
    }

    /// A chain root (genesis or checkpoint). Its work is only its own.
    pub fn root(header: BlockHeader, height: u32) -> Self {
        let work = ChainWork::from_header(&header);
        Self::new(header, None, height, work)
    }

    /// The child of `self` carrying `header`.
    pub fn build_next(&self, header: BlockHeader, transactions: Option<Vec<Transaction>>) -> Self {
        let work = self.work.add_header(&header);
        Self::new(header, transactions, self.height + 1, work)
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn prev_hash(&self) -> BlockHash {
        self.header.prev_blockhash
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn work(&self) -> &ChainWork {
        &self.work
    }

    pub fn timestamp(&self) -> u32 {
        self.header.time
    }

    pub fn transactions(&self) -> Option<&[Transaction]> {
        self.transactions.as_deref()
    }

    pub fn has_more_work_than(&self, other: &StorableBlock) -> bool {
        self.work > other.work
    }

    /// True for the first block of a retarget period.
    pub fn is_transition(&self, params: &NetworkParams) -> bool {
        params.is_retarget_height(self.height)
    }
}
