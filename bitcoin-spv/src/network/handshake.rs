//! Network handshake management.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Address, ServiceFlags};

use super::constants::{HANDSHAKE_TIMEOUT, MAX_USER_AGENT_LEN, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, USER_AGENT};
use super::transport::Transport;
use crate::error::{NetworkError, NetworkResult};

/// Handshake state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// Initial state.
    Init,
    /// Version message sent.
    VersionSent,
    /// Version received and verack sent.
    VersionReceivedVerackSent,
    /// Verack received.
    VerackReceived,
    /// Handshake complete.
    Complete,
}

/// What a peer told us about itself in its `version` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerVersion {
    pub version: u32,
    pub services: ServiceFlags,
    pub user_agent: String,
    /// Advertised best height; negative values are treated as zero.
    pub start_height: u32,
    pub relay: bool,
    /// Peer clock minus local clock, in seconds.
    pub time_offset: i64,
}

/// Settings for our side of the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub user_agent: Option<String>,
    /// Ask the peer to relay unfiltered transactions. Off when a bloom filter
    /// will be loaded right after the handshake.
    pub relay: bool,
    /// Our current height, advertised to the peer.
    pub start_height: u32,
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            relay: false,
            start_height: 0,
            timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

/// Manages the version/verack exchange with one peer.
pub struct HandshakeManager {
    config: HandshakeConfig,
    state: HandshakeState,
    peer_version: Option<PeerVersion>,
    verack_received: bool,
}

impl HandshakeManager {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            state: HandshakeState::Init,
            peer_version: None,
            verack_received: false,
        }
    }

    /// Perform the handshake. Version and verack may arrive in either order.
    pub async fn perform_handshake(&mut self, transport: &mut dyn Transport) -> NetworkResult<PeerVersion> {
        let address = transport.peer_address();
        let version_message = self.build_version_message(address);
        transport.send_message(NetworkMessage::Version(version_message)).await?;
        self.state = HandshakeState::VersionSent;
        tracing::debug!("Handshake initiated - version message sent to {}", address);

        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.exchange(transport)).await {
            Ok(Ok(version)) => {
                self.state = HandshakeState::Complete;
                tracing::info!(
                    "Handshake with {} complete: version {}, agent {}, height {}",
                    address,
                    version.version,
                    version.user_agent,
                    version.start_height
                );
                Ok(version)
            }
            Ok(Err(e)) => {
                tracing::debug!("Handshake with {} failed: {}", address, e);
                Err(e)
            }
            Err(_) => {
                tracing::debug!(
                    "Handshake timeout after {}s with {} - version_received={}, verack_received={}",
                    timeout.as_secs(),
                    address,
                    self.peer_version.is_some(),
                    self.verack_received
                );
                Err(NetworkError::Timeout)
            }
        }
    }

    async fn exchange(&mut self, transport: &mut dyn Transport) -> NetworkResult<PeerVersion> {
        loop {
            let Some(message) = transport.receive_message().await? else {
                continue;
            };
            if let Some(version) = self.handle_handshake_message(transport, message).await? {
                return Ok(version);
            }
        }
    }

    async fn handle_handshake_message(
        &mut self,
        transport: &mut dyn Transport,
        message: NetworkMessage,
    ) -> NetworkResult<Option<PeerVersion>> {
        match message {
            NetworkMessage::Version(version_msg) => {
                if version_msg.version < MIN_PROTOCOL_VERSION {
                    return Err(NetworkError::HandshakeFailed(format!(
                        "peer protocol version {} is below {}",
                        version_msg.version, MIN_PROTOCOL_VERSION
                    )));
                }
                self.peer_version = Some(peer_version_from(&version_msg));
                transport.send_message(NetworkMessage::Verack).await?;
                self.state = HandshakeState::VersionReceivedVerackSent;
            }
            NetworkMessage::Verack => {
                self.verack_received = true;
                if self.state == HandshakeState::VersionSent {
                    self.state = HandshakeState::VerackReceived;
                }
            }
            NetworkMessage::Ping(nonce) => {
                transport.send_message(NetworkMessage::Pong(nonce)).await?;
            }
            other => {
                tracing::debug!("Ignoring {} during handshake", other.cmd());
            }
        }

        if self.verack_received {
            return Ok(self.peer_version.clone());
        }
        Ok(None)
    }

    fn build_version_message(&self, address: SocketAddr) -> VersionMessage {
        let sender: SocketAddr = SocketAddr::from(([0, 0, 0, 0], 0));

        VersionMessage {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NONE,
            timestamp: unix_now(),
            receiver: Address::new(&address, ServiceFlags::NETWORK),
            sender: Address::new(&sender, ServiceFlags::NONE),
            nonce: rand::random(),
            user_agent: normalize_user_agent(self.config.user_agent.as_deref()),
            start_height: i32::try_from(self.config.start_height).unwrap_or(i32::MAX),
            relay: self.config.relay,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn peer_version(&self) -> Option<&PeerVersion> {
        self.peer_version.as_ref()
    }
}

fn peer_version_from(message: &VersionMessage) -> PeerVersion {
    PeerVersion {
        version: message.version,
        services: message.services,
        user_agent: message.user_agent.clone(),
        start_height: u32::try_from(message.start_height).unwrap_or(0),
        relay: message.relay,
        time_offset: message.timestamp - unix_now(),
    }
}

/// Wrap in slashes and bound to the length peers accept.
pub fn normalize_user_agent(user_agent: Option<&str>) -> String {
    let mut ua = user_agent.unwrap_or(USER_AGENT).to_string();
    if !ua.starts_with('/') {
        ua.insert(0, '/');
    }
    if !ua.ends_with('/') {
        ua.push('/');
    }
    if ua.len() > MAX_USER_AGENT_LEN {
        ua.truncate(MAX_USER_AGENT_LEN);
    }
    ua
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::from_secs(0)).as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::V1Transport;
    use bitcoin::Network;
    use bitcoin::p2p::Magic;
    use tokio::io::duplex;

    fn remote_version(version: u32, start_height: i32) -> VersionMessage {
        let address = SocketAddr::from(([127, 0, 0, 1], 18444));
        VersionMessage {
            version,
            services: ServiceFlags::NETWORK,
            timestamp: unix_now(),
            receiver: Address::new(&address, ServiceFlags::NONE),
            sender: Address::new(&address, ServiceFlags::NETWORK),
            nonce: 1,
            user_agent: "/Satoshi:27.0.0/".to_string(),
            start_height,
            relay: true,
        }
    }

    /// Run the remote side: answer with `version` then verack (or the reverse).
    async fn handshake_with(version: VersionMessage, verack_first: bool) -> NetworkResult<PeerVersion> {
        let (local, remote) = duplex(64 * 1024);
        let magic = Magic::from(Network::Regtest);
        let address = SocketAddr::from(([127, 0, 0, 1], 18444));
        let mut local = V1Transport::new(local, magic, address);
        let mut remote = V1Transport::new(remote, magic, address);

        let peer = tokio::spawn(async move {
            let ours = remote.receive_message().await.unwrap();
            assert!(matches!(ours, Some(NetworkMessage::Version(ref v)) if !v.relay));
            remote.send_message(NetworkMessage::Ping(5)).await.unwrap();
            if verack_first {
                remote.send_message(NetworkMessage::Verack).await.unwrap();
                remote.send_message(NetworkMessage::Version(version)).await.unwrap();
            } else {
                remote.send_message(NetworkMessage::Version(version)).await.unwrap();
                remote.send_message(NetworkMessage::Verack).await.unwrap();
            }
            remote
        });

        let mut manager = HandshakeManager::new(HandshakeConfig::default());
        let result = manager.perform_handshake(&mut local).await;
        let _remote = peer.await.unwrap();
        result
    }

    #[tokio::test]
    async fn test_handshake_either_order() {
        let version = handshake_with(remote_version(70016, 800_000), false).await.unwrap();
        assert_eq!(version.start_height, 800_000);
        assert_eq!(version.user_agent, "/Satoshi:27.0.0/");

        let version = handshake_with(remote_version(70016, 10), true).await.unwrap();
        assert_eq!(version.start_height, 10);
        assert!(version.time_offset.abs() <= 1);
    }

    #[tokio::test]
    async fn test_old_peers_rejected() {
        let err = handshake_with(remote_version(60002, 10), false).await.unwrap_err();
        assert!(matches!(err, NetworkError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn test_negative_start_height_is_zero() {
        let version = handshake_with(remote_version(70002, -5), false).await.unwrap();
        assert_eq!(version.start_height, 0);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (local, _remote) = duplex(64 * 1024);
        let address = SocketAddr::from(([127, 0, 0, 1], 18444));
        let mut local = V1Transport::new(local, Magic::from(Network::Regtest), address);
        let mut manager = HandshakeManager::new(HandshakeConfig {
            timeout: Duration::from_millis(50),
            ..HandshakeConfig::default()
        });
        assert!(matches!(manager.perform_handshake(&mut local).await, Err(NetworkError::Timeout)));
    }

    #[test]
    fn test_user_agent_normalization() {
        assert_eq!(normalize_user_agent(Some("wallet:1.0")), "/wallet:1.0/");
        assert_eq!(normalize_user_agent(None), USER_AGENT);
        assert_eq!(normalize_user_agent(Some(&"x".repeat(400))).len(), MAX_USER_AGENT_LEN);
    }
}
