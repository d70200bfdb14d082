//! Common type definitions for the Bitcoin SPV client.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::sync::SyncState;

/// Identifier of one peer session. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// How blocks are fetched from the download peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DownloadMode {
    /// Headers only; no filter is loaded.
    HeadersOnly,
    /// Headers while the head is older than `timestamp`, filtered blocks after.
    FastCatchUp {
        timestamp: u32,
    },
    /// Filtered blocks from the start.
    #[default]
    Full,
}

impl DownloadMode {
    pub fn uses_bloom_filter(&self) -> bool {
        !matches!(self, DownloadMode::HeadersOnly)
    }

    /// Whether the block after a head with `head_timestamp` is fetched as a header only.
    pub fn wants_headers(&self, head_timestamp: u32) -> bool {
        match self {
            DownloadMode::HeadersOnly => true,
            DownloadMode::FastCatchUp {
                timestamp,
            } => head_timestamp < *timestamp,
            DownloadMode::Full => false,
        }
    }

    pub fn fast_catch_up(&self) -> Option<u32> {
        match self {
            DownloadMode::FastCatchUp {
                timestamp,
            } => Some(*timestamp),
            _ => None,
        }
    }
}

/// Connected peer as seen by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: SocketAddr,
    /// Protocol version from the handshake.
    pub version: u32,
    pub services: u64,
    pub user_agent: String,
    /// Best height the peer advertised, raised as it announces blocks.
    pub best_height: u32,
    pub connected_at: SystemTime,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Round trip of the last answered ping.
    pub ping_latency: Option<Duration>,
    /// Our height reached this peer's advertised height.
    pub synced: bool,
}

/// Download progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub state: SyncState,
    pub current_height: u32,
    /// Height advertised by the download peer.
    pub target_height: u32,
    /// Blocks integrated this session.
    pub blocks_downloaded: u64,
    pub sync_start: SystemTime,
    pub last_update: SystemTime,
}

impl SyncProgress {
    pub fn blocks_left(&self) -> u32 {
        self.target_height.saturating_sub(self.current_height)
    }

    pub fn percentage(&self) -> f64 {
        if self.target_height == 0 {
            return 0.0;
        }
        (f64::from(self.current_height) / f64::from(self.target_height)).min(1.0) * 100.0
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        let now = SystemTime::now();
        Self {
            state: SyncState::Empty,
            current_height: 0,
            target_height: 0,
            blocks_downloaded: 0,
            sync_start: now,
            last_update: now,
        }
    }
}

/// Snapshot of the peer group.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerGroupStatus {
    pub peers: Vec<PeerInfo>,
    pub download_peer: Option<PeerId>,
    pub connecting: usize,
    /// Connection failures currently counted against hosts.
    pub connection_failures: u32,
    pub blacklisted_hosts: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub progress: SyncProgress,
}

impl PeerGroupStatus {
    pub fn connected(&self) -> usize {
        self.peers.len()
    }

    pub fn is_synced(&self) -> bool {
        self.progress.state == SyncState::Synced
    }

    pub fn blocks_left(&self) -> u32 {
        self.progress.blocks_left()
    }
}
