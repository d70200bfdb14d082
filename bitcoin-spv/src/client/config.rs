//! Configuration management for the Bitcoin SPV client.

use std::net::SocketAddr;
use std::time::Duration;

use bitcoin::Network;
use bitcoin::p2p::message_bloom::BloomFlags;

use crate::bloom::{BloomFilterConfig, BloomRateConfig};
use crate::chain::ChainStateConfig;
use crate::chain::chain_state::{DEFAULT_MAX_SIZE, DEFAULT_MAX_STEP};
use crate::logging::LoggingConfig;
use crate::network::constants::{
    CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, MAX_CONNECTION_FAILURES, MAX_CONNECTIONS, PING_INTERVAL, RECONNECTION_DELAY,
    REQUEST_TIMEOUT, SEED_TTL,
};
use crate::network::{HandshakeConfig, PeerSettings, PoolConfig};
use crate::params::NetworkParams;
use crate::types::DownloadMode;

/// Configuration for the Bitcoin SPV client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Network to connect to.
    pub network: Network,

    /// Peers to connect to. DNS seeds are used when empty.
    pub peers: Vec<SocketAddr>,

    /// Never use DNS discovery or addresses learned from peers.
    pub restrict_to_configured_peers: bool,

    /// Maximum number of simultaneous peer sessions.
    pub max_connections: usize,

    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,

    /// How long the download peer may stay silent on an outstanding request.
    pub request_timeout: Duration,

    pub ping_interval: Duration,

    /// Minimum time between attempts to fill free connection slots.
    pub reconnection_delay: Duration,

    /// Failures a host may accumulate before it is blacklisted.
    pub max_connection_failures: u32,

    /// How long a blacklisted host stays blacklisted.
    pub seed_ttl: Duration,

    pub download_mode: DownloadMode,

    /// Bloom filter rate adaptation.
    pub bloom_rate: BloomRateConfig,

    pub bloom_flags: BloomFlags,

    /// Fixed bloom tweak. Drawn at random per session when unset.
    pub bloom_tweak: Option<u32>,

    /// Blocks kept in memory below the head.
    pub max_size: u32,

    /// Longest side branch walked when looking for a fork base.
    pub max_step: u32,

    /// User agent to advertise. A default including the crate version is used when unset.
    pub user_agent: Option<String>,

    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(Network::Bitcoin)
    }
}

impl ClientConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            peers: Vec::new(),
            restrict_to_configured_peers: false,
            max_connections: MAX_CONNECTIONS,
            connect_timeout: CONNECT_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            ping_interval: PING_INTERVAL,
            reconnection_delay: RECONNECTION_DELAY,
            max_connection_failures: MAX_CONNECTION_FAILURES,
            seed_ttl: SEED_TTL,
            download_mode: DownloadMode::default(),
            bloom_rate: BloomRateConfig::default(),
            bloom_flags: BloomFlags::All,
            bloom_tweak: None,
            max_size: DEFAULT_MAX_SIZE,
            max_step: DEFAULT_MAX_STEP,
            user_agent: None,
            logging: LoggingConfig::default(),
        }
    }

    pub fn mainnet() -> Self {
        Self::new(Network::Bitcoin)
    }

    pub fn testnet() -> Self {
        Self::new(Network::Testnet)
    }

    /// Regtest talks to local nodes only.
    pub fn regtest() -> Self {
        let mut config = Self::new(Network::Regtest);
        config.restrict_to_configured_peers = true;
        config
    }

    pub fn add_peer(&mut self, address: SocketAddr) -> &mut Self {
        self.peers.push(address);
        self
    }

    pub fn with_peers(mut self, peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.peers.extend(peers);
        self
    }

    pub fn with_restrict_to_configured_peers(mut self, restrict: bool) -> Self {
        self.restrict_to_configured_peers = restrict;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_reconnection_delay(mut self, delay: Duration) -> Self {
        self.reconnection_delay = delay;
        self
    }

    pub fn with_max_connection_failures(mut self, max: u32) -> Self {
        self.max_connection_failures = max;
        self
    }

    pub fn with_seed_ttl(mut self, ttl: Duration) -> Self {
        self.seed_ttl = ttl;
        self
    }

    pub fn with_download_mode(mut self, mode: DownloadMode) -> Self {
        self.download_mode = mode;
        self
    }

    pub fn headers_only(self) -> Self {
        self.with_download_mode(DownloadMode::HeadersOnly)
    }

    pub fn with_bloom_rate(mut self, rate: BloomRateConfig) -> Self {
        self.bloom_rate = rate;
        self
    }

    pub fn with_bloom_flags(mut self, flags: BloomFlags) -> Self {
        self.bloom_flags = flags;
        self
    }

    pub fn with_bloom_tweak(mut self, tweak: u32) -> Self {
        self.bloom_tweak = Some(tweak);
        self
    }

    pub fn with_max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_max_step(mut self, max_step: u32) -> Self {
        self.max_step = max_step;
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }
        if self.restrict_to_configured_peers && self.peers.is_empty() {
            return Err("restrict_to_configured_peers requires at least one peer".to_string());
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("request_timeout", self.request_timeout),
            ("ping_interval", self.ping_interval),
        ] {
            if value.is_zero() {
                return Err(format!("{} must be > 0", name));
            }
        }
        if self.max_size == 0 {
            return Err("max_size must be > 0".to_string());
        }
        if self.max_step == 0 {
            return Err("max_step must be > 0".to_string());
        }
        if let Some(agent) = &self.user_agent {
            if agent.trim_matches('/').is_empty() {
                return Err("user_agent must not be empty".to_string());
            }
        }
        self.bloom_rate.validate()
    }

    pub fn params(&self) -> NetworkParams {
        NetworkParams::for_network(self.network)
    }

    pub fn chain_state_config(&self) -> ChainStateConfig {
        ChainStateConfig {
            max_size: self.max_size,
            max_step: self.max_step,
            ..ChainStateConfig::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            max_connection_failures: self.max_connection_failures,
            seed_ttl: self.seed_ttl,
        }
    }

    pub fn bloom_config(&self) -> BloomFilterConfig {
        BloomFilterConfig {
            rate: self.bloom_rate,
            flags: self.bloom_flags,
            tweak: self.bloom_tweak,
        }
    }

    /// Session settings for a peer, given our height when connecting.
    pub fn peer_settings(&self, start_height: u32) -> PeerSettings {
        PeerSettings {
            handshake: HandshakeConfig {
                user_agent: self.user_agent.clone(),
                relay: !self.download_mode.uses_bloom_filter(),
                start_height,
                timeout: self.handshake_timeout,
            },
            ping_interval: self.ping_interval,
        }
    }
}
