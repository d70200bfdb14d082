//! Bitcoin SPV (Simplified Payment Verification) client library.
//!
//! This library implements a lightweight Bitcoin node that can:
//!
//! - Connect to a group of peers and elect one to download from
//! - Synchronize and validate block headers, including difficulty retargets
//! - Track forks and orphans, and report reorganizations
//! - Download BIP37 filtered blocks for a watched set of elements
//! - Announce and serve transactions to its peers
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bitcoin_spv::network::TcpConnector;
//! use bitcoin_spv::storage::MemoryBlockStore;
//! use bitcoin_spv::sync::{SpvEvent, SyncOrchestrator};
//! use bitcoin_spv::ClientConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::testnet();
//!     let connector = Arc::new(TcpConnector::new(config.params().magic).with_timeout(config.connect_timeout));
//!
//!     let (handle, mut events, _task) =
//!         SyncOrchestrator::spawn(config, Box::new(MemoryBlockStore::new()), connector)?;
//!     handle.start([])?;
//!     handle.request_download()?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let SpvEvent::DownloadFinished { height, .. } = event {
//!             println!("Synced to {}", height);
//!             break;
//!         }
//!     }
//!
//!     handle.stop().await?;
//!     Ok(())
//! }
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod bloom;
pub mod chain;
pub mod client;
pub mod error;
pub mod logging;
pub mod network;
pub mod params;
pub mod storage;
pub mod sync;
pub mod types;

// Re-export main types for convenience
pub use client::ClientConfig;
pub use error::{
    BloomError, ChainError, LoggingError, LoggingResult, NetworkError, SpvError, StorageError, SyncError,
    SyncResult, ValidationError,
};
pub use logging::{LogFileConfig, LoggingConfig, LoggingGuard, init_console_logging, init_logging};
pub use params::NetworkParams;
pub use sync::{EventReceiver, SpvEvent, SyncHandle, SyncOrchestrator, SyncState};
pub use tracing::level_filters::LevelFilter;
pub use types::{DownloadMode, PeerGroupStatus, PeerId, PeerInfo, SyncProgress};

// Re-export commonly used bitcoin types
pub use bitcoin::{BlockHash, Network, OutPoint, ScriptBuf, Transaction, Txid};

// Re-export hash trait
pub use bitcoin::hashes::Hash;

/// Current version of the bitcoin-spv library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
