//! Error types for the Bitcoin SPV client.

use std::io;

use bitcoin::BlockHash;
use thiserror::Error;

/// Main error type for the Bitcoin SPV client.
#[derive(Debug, Error)]
pub enum SpvError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Bloom filter error: {0}")]
    Bloom(#[from] BloomError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),
}

/// Logging-related errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Subscriber initialization failed: {0}")]
    SubscriberInit(String),

    #[error("Log rotation failed: {0}")]
    RotationFailed(String),
}

/// Network-related errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Transport-level failure (refused, reset, unreachable).
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// No response within the connect or request timeout.
    #[error("Timeout occurred")]
    Timeout,

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Not connected")]
    NotConnected,

    /// A well-framed message whose command this client does not handle.
    #[error("Unsupported message: {0}")]
    UnsupportedMessage(String),

    #[error("Host {0} is blacklisted")]
    Blacklisted(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] bitcoin::consensus::encode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Address parse error: {0}")]
    AddressParse(String),
}

impl NetworkError {
    /// Whether this error should count against the peer's connection failure budget.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            NetworkError::ConnectionFailed(_)
                | NetworkError::Timeout
                | NetworkError::HandshakeFailed(_)
                | NetworkError::Io(_)
        )
    }
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),
}

/// Header and block validation errors.
///
/// None of these are fatal: they are local to a single `add_block` call and
/// no chain state is mutated when one is returned.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Header fails format or proof-of-work checks.
    #[error("Malformed block {hash}: {reason}")]
    Malformed {
        hash: BlockHash,
        reason: String,
    },

    /// Bad retarget, timestamp drift or structurally invalid placement.
    #[error("Invalid block {hash}: {reason}")]
    InvalidBlock {
        hash: BlockHash,
        reason: String,
    },

    /// Partial merkle tree of a filtered block does not match its header.
    #[error("Invalid partial merkle tree in block {hash}: {reason}")]
    InvalidPartialMerkleTree {
        hash: BlockHash,
        reason: String,
    },
}

impl ValidationError {
    /// Hash of the offending block.
    pub fn block_hash(&self) -> BlockHash {
        match self {
            ValidationError::Malformed {
                hash,
                ..
            }
            | ValidationError::InvalidBlock {
                hash,
                ..
            }
            | ValidationError::InvalidPartialMerkleTree {
                hash,
                ..
            } => *hash,
        }
    }
}

/// Errors raised by the chain state machine that are not header validation failures.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The common ancestor of a heavier fork could not be located within `max_step`
    /// blocks. Requires caller intervention, typically a rescan.
    #[error("Fork base not found for {fork_tip} after {steps} steps")]
    ForkBaseNotFound {
        fork_tip: BlockHash,
        steps: u32,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Bloom filter construction errors.
#[derive(Debug, Error, PartialEq)]
pub enum BloomError {
    #[error("False positive rate {0} is outside (0, 1)")]
    InvalidFalsePositiveRate(f64),

    #[error("Invalid bloom filter flags: {0}")]
    InvalidFlags(u8),
}

/// Synchronization-related errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No response from the download peer within the request timeout
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Sync stalled beyond recovery (e.g. reorg base not found, no peers left)
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// Network-related errors (e.g., connection failures, protocol errors)
    #[error("Network error: {0}")]
    Network(String),

    /// Validation errors for data received during sync
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// The orchestrator task is no longer running
    #[error("Sync orchestrator stopped")]
    Stopped,
}

impl SyncError {
    /// Returns a static string representing the error category based on the variant
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::Stopped => "state",
            SyncError::Timeout(_) => "timeout",
            SyncError::DownloadFailed(_) => "download",
            SyncError::Validation(_) => "validation",
            SyncError::Network(_) => "network",
            SyncError::Storage(_) => "storage",
        }
    }
}

/// Type alias for Result with SpvError.
pub type Result<T> = std::result::Result<T, SpvError>;

/// Type alias for network operation results.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Type alias for storage operation results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Type alias for validation operation results.
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// Type alias for chain state results.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Type alias for bloom filter results.
pub type BloomResult<T> = std::result::Result<T, BloomError>;

/// Type alias for sync operation results.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Type alias for logging operation results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;

impl From<NetworkError> for SyncError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Timeout => SyncError::Timeout(err.to_string()),
            other => SyncError::Network(other.to_string()),
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<ChainError> for SyncError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Validation(e) => SyncError::Validation(e.to_string()),
            ChainError::Storage(e) => SyncError::Storage(e.to_string()),
            e @ ChainError::ForkBaseNotFound {
                ..
            } => SyncError::DownloadFailed(e.to_string()),
        }
    }
}
