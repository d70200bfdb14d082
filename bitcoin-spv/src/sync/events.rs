//! Events published by the sync actor.

use std::net::SocketAddr;

use bitcoin::hashes::sha256d;
use bitcoin::p2p::message_network::RejectReason;
use bitcoin::{BlockHash, Transaction};
use tokio::sync::mpsc;

use crate::chain::{ChainLocation, ReorgEvent};
use crate::error::SyncError;
use crate::types::PeerId;

/// Receiving end of the event stream returned with a [`SyncHandle`](super::SyncHandle).
pub type EventReceiver = mpsc::UnboundedReceiver<SpvEvent>;

/// Observable changes, in the order the actor made them.
///
/// Consumers run outside the actor; they may call back into the handle freely.
#[derive(Debug)]
pub enum SpvEvent {
    /// A session completed its handshake.
    PeerConnected {
        peer: PeerId,
        address: SocketAddr,
        version: u32,
        user_agent: String,
        best_height: u32,
    },

    /// A connected session ended.
    PeerDisconnected {
        peer: PeerId,
        address: SocketAddr,
        /// `None` when we closed it.
        error: Option<String>,
    },

    /// A download peer was elected and the first request went out.
    DownloadStarted {
        peer: PeerId,
        address: SocketAddr,
        from_height: u32,
        target_height: u32,
    },

    /// Emitted after every batch of integrated headers or blocks.
    DownloadProgress {
        current_height: u32,
        target_height: u32,
    },

    /// The chain reached the download peer's height.
    DownloadFinished {
        peer: PeerId,
        height: u32,
    },

    /// The download cannot continue from the current state without intervention.
    DownloadFailed {
        peer: Option<PeerId>,
        error: SyncError,
    },

    /// A block was placed on the main chain or on a fork.
    BlockAdded {
        hash: BlockHash,
        height: u32,
        location: ChainLocation,
    },

    /// The main chain switched branches.
    Reorganized(ReorgEvent),

    /// A transaction relevant to the watched set.
    ///
    /// `block` is the containing block and its height, `None` for mempool relay.
    TransactionReceived {
        tx: Transaction,
        block: Option<(BlockHash, u32)>,
    },

    /// A peer rejected one of our messages.
    RejectReceived {
        peer: PeerId,
        message: String,
        code: RejectReason,
        reason: String,
        hash: sha256d::Hash,
    },

    /// A rescan reset the chain. Always precedes the requests of the new cycle.
    RescanStarted {
        from_height: u32,
        /// Height the chain restarted from.
        checkpoint_height: u32,
    },

    /// The actor flushed the chain and exited.
    Stopped,
}

impl SpvEvent {
    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            SpvEvent::PeerConnected {
                address,
                best_height,
                ..
            } => format!("PeerConnected({} height={})", address, best_height),
            SpvEvent::PeerDisconnected {
                address,
                ..
            } => format!("PeerDisconnected({})", address),
            SpvEvent::DownloadStarted {
                address,
                from_height,
                target_height,
                ..
            } => format!("DownloadStarted({} {}..{})", address, from_height, target_height),
            SpvEvent::DownloadProgress {
                current_height,
                target_height,
            } => format!("DownloadProgress({}/{})", current_height, target_height),
            SpvEvent::DownloadFinished {
                height,
                ..
            } => format!("DownloadFinished({})", height),
            SpvEvent::DownloadFailed {
                error,
                ..
            } => format!("DownloadFailed({})", error),
            SpvEvent::BlockAdded {
                hash,
                height,
                location,
            } => format!("BlockAdded({} {} {:?})", height, hash, location),
            SpvEvent::Reorganized(reorg) => format!(
                "Reorganized(ancestor={} depth={} new={})",
                reorg.ancestor.height(),
                reorg.depth(),
                reorg.new_blocks.len()
            ),
            SpvEvent::TransactionReceived {
                tx,
                block,
            } => match block {
                Some((_, height)) => format!("TransactionReceived({} at {})", tx.compute_txid(), height),
                None => format!("TransactionReceived({} unconfirmed)", tx.compute_txid()),
            },
            SpvEvent::RejectReceived {
                message,
                reason,
                ..
            } => format!("RejectReceived({}: {})", message, reason),
            SpvEvent::RescanStarted {
                from_height,
                checkpoint_height,
            } => format!("RescanStarted({} from checkpoint {})", from_height, checkpoint_height),
            SpvEvent::Stopped => "Stopped".to_string(),
        }
    }
}
