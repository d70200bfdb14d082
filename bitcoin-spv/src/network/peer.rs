//! One peer session: connect, handshake, then pump messages.
//!
//! Each session runs in its own task and owns its transport. Decoded messages
//! go to the sync actor as [`PeerEvent`]s; outbound messages arrive on a
//! per-peer channel. Pings are answered here; only pongs to pings the actor
//! sent itself reach it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bitcoin::p2p::message::NetworkMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connector::Connector;
use super::constants::PING_INTERVAL;
use super::event::PeerEvent;
use super::handshake::{HandshakeConfig, HandshakeManager, PeerVersion};
use super::message::PeerMessage;
use super::pool::ConnectionPool;
use super::transport::Transport;
use crate::error::NetworkError;
use crate::types::{PeerId, PeerInfo};

#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub handshake: HandshakeConfig,
    pub ping_interval: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            ping_interval: PING_INTERVAL,
        }
    }
}

/// The actor's side of a session.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
    address: SocketAddr,
    sender: mpsc::UnboundedSender<NetworkMessage>,
    cancel: CancellationToken,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Queue a message. Returns false if the session already ended.
    pub fn send(&self, message: NetworkMessage) -> bool {
        self.sender.send(message).is_ok()
    }

    /// Ask the session to close. It still reports `Disconnected`.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

/// Start a session to `address` under the slot `id` reserved in `pool`.
pub fn spawn_peer(
    id: PeerId,
    address: SocketAddr,
    connector: Arc<dyn Connector>,
    settings: PeerSettings,
    pool: ConnectionPool,
    events: mpsc::UnboundedSender<PeerEvent>,
    shutdown: &CancellationToken,
) -> PeerHandle {
    let (sender, outbound) = mpsc::unbounded_channel();
    let cancel = shutdown.child_token();

    let session = PeerSession {
        id,
        address,
        settings,
        pool,
        events,
        cancel: cancel.clone(),
        pending_ping: None,
    };
    tokio::spawn(session.run(connector, outbound));

    PeerHandle {
        id,
        address,
        sender,
        cancel,
    }
}

struct PeerSession {
    id: PeerId,
    address: SocketAddr,
    settings: PeerSettings,
    pool: ConnectionPool,
    events: mpsc::UnboundedSender<PeerEvent>,
    cancel: CancellationToken,
    /// Nonce and send time of the unanswered ping.
    pending_ping: Option<(u64, Instant)>,
}

impl PeerSession {
    async fn run(mut self, connector: Arc<dyn Connector>, outbound: mpsc::UnboundedReceiver<NetworkMessage>) {
        let mut transport = match self.establish(connector.as_ref()).await {
            Ok(Some((transport, version))) => {
                self.pool.mark_connected(self.peer_info(&version)).await;
                let _ = self.events.send(PeerEvent::Connected {
                    id: self.id,
                    address: self.address,
                    version,
                });
                transport
            }
            Ok(None) => {
                self.pool.remove(self.id).await;
                let _ = self.events.send(PeerEvent::Disconnected {
                    id: self.id,
                    address: self.address,
                    error: None,
                });
                return;
            }
            Err(error) => {
                tracing::debug!("Session {} to {} failed to start: {}", self.id, self.address, error);
                self.pool.remove(self.id).await;
                let _ = self.events.send(PeerEvent::ConnectFailed {
                    id: self.id,
                    address: self.address,
                    error,
                });
                return;
            }
        };

        let error = self.pump(transport.as_mut(), outbound).await;
        let _ = transport.shutdown().await;
        self.pool.record_traffic(self.id, transport.bytes_sent(), transport.bytes_received()).await;
        self.pool.remove(self.id).await;

        match &error {
            Some(e) => tracing::info!("Peer {} ({}) disconnected: {}", self.address, self.id, e),
            None => tracing::debug!("Peer {} ({}) closed locally", self.address, self.id),
        }
        let _ = self.events.send(PeerEvent::Disconnected {
            id: self.id,
            address: self.address,
            error,
        });
    }

    /// Connect and handshake. `Ok(None)` means cancelled first.
    async fn establish(
        &self,
        connector: &dyn Connector,
    ) -> Result<Option<(Box<dyn Transport>, PeerVersion)>, NetworkError> {
        let mut transport = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            result = connector.connect(self.address) => result?,
        };

        let mut handshake = HandshakeManager::new(self.settings.handshake.clone());
        let version = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            result = handshake.perform_handshake(transport.as_mut()) => result?,
        };

        // getaddr right after the handshake, as peers expect
        transport.send_message(NetworkMessage::GetAddr).await?;
        Ok(Some((transport, version)))
    }

    /// Run until cancelled or the transport fails. Returns the failure, if any.
    async fn pump(
        &mut self,
        transport: &mut dyn Transport,
        mut outbound: mpsc::UnboundedReceiver<NetworkMessage>,
    ) -> Option<NetworkError> {
        let interval = self.settings.ping_interval;
        let mut ping_timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                queued = outbound.recv() => {
                    let Some(message) = queued else {
                        return None;
                    };
                    if let Err(e) = transport.send_message(message).await {
                        return Some(e);
                    }
                }
                _ = ping_timer.tick() => {
                    let nonce = rand::random::<u64>();
                    if let Err(e) = transport.send_message(NetworkMessage::Ping(nonce)).await {
                        return Some(e);
                    }
                    self.pending_ping = Some((nonce, Instant::now()));
                    tracing::trace!("Sent ping to {} with nonce {}", self.address, nonce);
                }
                received = transport.receive_message() => {
                    match received {
                        Ok(Some(message)) => {
                            if let Err(e) = self.handle_message(transport, message).await {
                                return Some(e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => return Some(e),
                    }
                }
            }

            self.pool.record_traffic(self.id, transport.bytes_sent(), transport.bytes_received()).await;
        }
    }

    async fn handle_message(
        &mut self,
        transport: &mut dyn Transport,
        message: NetworkMessage,
    ) -> Result<(), NetworkError> {
        match PeerMessage::try_from(message) {
            Ok(PeerMessage::Ping(nonce)) => {
                transport.send_message(NetworkMessage::Pong(nonce)).await?;
            }
            Ok(PeerMessage::Pong(nonce)) => match self.pending_ping {
                Some((expected, sent_at)) if expected == nonce => {
                    self.pending_ping = None;
                    self.pool.record_ping(self.id, sent_at.elapsed()).await;
                }
                // Answer to a ping the actor sent.
                _ => self.forward(PeerMessage::Pong(nonce)),
            },
            Ok(message) => self.forward(message),
            Err(NetworkError::UnsupportedMessage(command)) => {
                tracing::debug!("Rejected unsupported message '{}' from {}", command, self.address);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn forward(&self, message: PeerMessage) {
        let event = PeerEvent::Message {
            id: self.id,
            message,
        };
        if self.events.send(event).is_err() {
            self.cancel.cancel();
        }
    }

    fn peer_info(&self, version: &PeerVersion) -> PeerInfo {
        PeerInfo {
            id: self.id,
            address: self.address,
            version: version.version,
            services: version.services.to_u64(),
            user_agent: version.user_agent.clone(),
            best_height: version.start_height,
            connected_at: SystemTime::now(),
            bytes_sent: 0,
            bytes_received: 0,
            ping_latency: None,
            synced: false,
        }
    }
}
