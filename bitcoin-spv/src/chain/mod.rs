//! Header chain management.
//!
//! [`ChainState`] owns the in-memory window of the best chain together with
//! side branches and orphans. It validates proof of work, timestamps and
//! difficulty transitions, and reports reorganizations as [`ReorgEvent`]s.

pub mod block_locator;
pub mod chain_state;
pub mod chain_tip;
pub mod chain_work;
pub mod checkpoints;
pub mod difficulty;
pub mod orphan_pool;
pub mod reorg;
pub mod storable_block;

#[cfg(test)]
mod chain_state_test;
#[cfg(test)]
mod orphan_pool_test;
#[cfg(test)]
mod reorg_test;

pub use block_locator::BlockLocator;
pub use chain_state::{AddBlockOutcome, ChainState, ChainStateConfig};
pub use chain_tip::{ChainTip, ChainTipManager};
pub use chain_work::ChainWork;
pub use checkpoints::{Checkpoint, CheckpointManager};
pub use orphan_pool::{OrphanBlock, OrphanPool};
pub use reorg::{ChainEvent, ChainLocation, ReorgEvent};
pub use storable_block::StorableBlock;
