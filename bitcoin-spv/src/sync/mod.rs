//! Synchronization with the peer group.
//!
//! [`SyncOrchestrator`] is an actor: it owns the chain, the block store, the
//! bloom filter and the download state, and is driven through a cloneable
//! [`SyncHandle`]. One peer at a time is elected to download from. Headers
//! are requested with `getheaders`, filtered blocks with `getblocks` followed
//! by `getdata`, and everything observable is published as [`SpvEvent`]s.

pub mod download;
pub mod events;
pub mod handle;
pub mod orchestrator;
pub mod state;

pub use download::{DownloadState, PendingFilteredBlock, RequestKind};
pub use events::{EventReceiver, SpvEvent};
pub use handle::{SyncCommand, SyncHandle};
pub use orchestrator::SyncOrchestrator;
pub use state::{SyncState, SyncTracker};
