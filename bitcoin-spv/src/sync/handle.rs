//! Cloneable handle to the sync actor.
//!
//! Every call posts a [`SyncCommand`] and returns without waiting for the
//! actor, except the queries and [`SyncHandle::stop`], which wait for the
//! reply. Never await them from inside the actor task.

use std::net::SocketAddr;

use bitcoin::Transaction;
use tokio::sync::{mpsc, oneshot};

use crate::error::{SyncError, SyncResult};
use crate::types::PeerGroupStatus;

/// Commands processed by the sync actor, in the order they were sent.
#[derive(Debug)]
pub enum SyncCommand {
    /// Connect to `peers` in addition to the configured ones.
    Start {
        peers: Vec<SocketAddr>,
    },
    RequestDownload,
    StopDownload,
    /// Drop the download peer and elect another one.
    ReconnectForDownload,
    /// Restart the chain from the checkpoint at or below `from_height`.
    Rescan {
        from_height: u32,
    },
    PublishTransaction(Transaction),
    /// Add a raw element to the bloom filter.
    Watch(Vec<u8>),
    Status {
        response: oneshot::Sender<PeerGroupStatus>,
    },
    /// Flush and exit. The reply is sent after `SpvEvent::Stopped`.
    Stop {
        response: oneshot::Sender<()>,
    },
}

/// Client handle for interacting with the sync actor.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    command_tx: mpsc::UnboundedSender<SyncCommand>,
}

impl SyncHandle {
    pub(crate) fn new(command_tx: mpsc::UnboundedSender<SyncCommand>) -> Self {
        Self {
            command_tx,
        }
    }

    fn send(&self, command: SyncCommand) -> SyncResult<()> {
        self.command_tx.send(command).map_err(|_| SyncError::Stopped)
    }

    /// Open connections to the configured peers and `peers`.
    pub fn start(&self, peers: impl IntoIterator<Item = SocketAddr>) -> SyncResult<()> {
        self.send(SyncCommand::Start {
            peers: peers.into_iter().collect(),
        })
    }

    /// Elect a download peer and follow the chain until stopped.
    pub fn request_download(&self) -> SyncResult<()> {
        self.send(SyncCommand::RequestDownload)
    }

    /// Forget the download peer. Connections stay open.
    pub fn stop_download(&self) -> SyncResult<()> {
        self.send(SyncCommand::StopDownload)
    }

    pub fn reconnect_for_download(&self) -> SyncResult<()> {
        self.send(SyncCommand::ReconnectForDownload)
    }

    pub fn rescan(&self, from_height: u32) -> SyncResult<()> {
        self.send(SyncCommand::Rescan {
            from_height,
        })
    }

    /// Announce `tx` to every peer and serve it on request.
    pub fn publish_transaction(&self, tx: Transaction) -> SyncResult<()> {
        self.send(SyncCommand::PublishTransaction(tx))
    }

    /// Watch a raw element: a pubkey hash, a script push or a serialized outpoint.
    pub fn watch(&self, element: impl Into<Vec<u8>>) -> SyncResult<()> {
        self.send(SyncCommand::Watch(element.into()))
    }

    pub async fn status(&self) -> SyncResult<PeerGroupStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(SyncCommand::Status {
            response: tx,
        })?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    pub async fn is_synced(&self) -> SyncResult<bool> {
        Ok(self.status().await?.is_synced())
    }

    pub async fn blocks_left(&self) -> SyncResult<u32> {
        Ok(self.status().await?.blocks_left())
    }

    /// Stop the actor and wait until it has drained its peers and flushed the chain.
    pub async fn stop(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(SyncCommand::Stop {
            response: tx,
        })?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    /// Like [`stop`](Self::stop), but calls `completion` from a separate task.
    pub fn stop_with_completion<F>(&self, completion: F)
    where
        F: FnOnce(SyncResult<()>) + Send + 'static,
    {
        let handle = self.clone();
        tokio::spawn(async move {
            completion(handle.stop().await);
        });
    }

    /// Whether the actor is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }
}
