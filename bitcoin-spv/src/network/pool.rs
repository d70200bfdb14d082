//! Connection pool: live sessions, their counters, and host failure accounting.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::constants::{MAX_CONNECTION_FAILURES, MAX_CONNECTIONS, SEED_TTL};
use crate::error::{NetworkError, NetworkResult};
use crate::types::{PeerId, PeerInfo};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Failures a host may accumulate before it is blacklisted.
    pub max_connection_failures: u32,
    pub seed_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS,
            max_connection_failures: MAX_CONNECTION_FAILURES,
            seed_ttl: SEED_TTL,
        }
    }
}

#[derive(Default)]
struct PoolState {
    peers: HashMap<PeerId, PeerInfo>,
    /// Sessions still connecting or handshaking.
    connecting: HashMap<PeerId, SocketAddr>,
    failures: HashMap<SocketAddr, u32>,
    /// Host -> blacklisted until.
    blacklist: HashMap<SocketAddr, Instant>,
    /// Traffic of sessions that already closed.
    closed_bytes_sent: u64,
    closed_bytes_received: u64,
}

impl PoolState {
    fn is_blacklisted(&self, address: &SocketAddr, now: Instant) -> bool {
        self.blacklist.get(address).is_some_and(|until| *until > now)
    }

    fn is_in_use(&self, address: &SocketAddr) -> bool {
        self.connecting.values().any(|a| a == address) || self.peers.values().any(|p| p.address == *address)
    }
}

/// Pool shared between the sync actor and the peer tasks.
///
/// Cheap to clone; all clones see the same state.
#[derive(Clone)]
pub struct ConnectionPool {
    config: PoolConfig,
    state: Arc<RwLock<PoolState>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(PoolState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Reserve a slot for a new session to `address`.
    pub async fn begin_connect(&self, address: SocketAddr) -> NetworkResult<PeerId> {
        let mut state = self.state.write().await;
        let now = Instant::now();

        if state.is_blacklisted(&address, now) {
            return Err(NetworkError::Blacklisted(address.to_string()));
        }
        state.blacklist.remove(&address);

        if state.is_in_use(&address) {
            return Err(NetworkError::ConnectionFailed(format!("Already connected to {}", address)));
        }
        if state.peers.len() + state.connecting.len() >= self.config.max_connections {
            return Err(NetworkError::ConnectionFailed(format!(
                "Maximum connections ({}) reached",
                self.config.max_connections
            )));
        }

        let id = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.connecting.insert(id, address);
        Ok(id)
    }

    /// Promote a connecting session after its handshake.
    pub async fn mark_connected(&self, info: PeerInfo) {
        let mut state = self.state.write().await;
        state.connecting.remove(&info.id);
        state.failures.remove(&info.address);
        tracing::info!("Added connection to {} ({}), total peers: {}", info.address, info.id, state.peers.len() + 1);
        state.peers.insert(info.id, info);
    }

    /// Forget a session in any phase. Returns the peer if it had connected.
    pub async fn remove(&self, id: PeerId) -> Option<PeerInfo> {
        let mut state = self.state.write().await;
        state.connecting.remove(&id);
        let removed = state.peers.remove(&id);
        if let Some(peer) = &removed {
            state.closed_bytes_sent += peer.bytes_sent;
            state.closed_bytes_received += peer.bytes_received;
            tracing::info!("Removed connection to {} ({}), {} peers remaining", peer.address, id, state.peers.len());
        }
        removed
    }

    /// Count a connect, handshake or request failure against `address`.
    ///
    /// Returns true when this failure blacklisted the host.
    pub async fn record_failure(&self, address: SocketAddr) -> bool {
        let mut state = self.state.write().await;
        let failures = {
            let count = state.failures.entry(address).or_insert(0);
            *count += 1;
            *count
        };

        if failures > self.config.max_connection_failures {
            state.failures.remove(&address);
            state.blacklist.insert(address, Instant::now() + self.config.seed_ttl);
            tracing::warn!(
                "Blacklisting {} for {}s after {} connection failures",
                address,
                self.config.seed_ttl.as_secs(),
                failures
            );
            return true;
        }
        tracing::debug!("Connection failure {} of {} for {}", failures, self.config.max_connection_failures, address);
        false
    }

    /// Blacklist `address` for `seed_ttl` right away.
    pub async fn ban(&self, address: SocketAddr) {
        let mut state = self.state.write().await;
        state.failures.remove(&address);
        state.blacklist.insert(address, Instant::now() + self.config.seed_ttl);
        tracing::warn!("Banned {} for {}s", address, self.config.seed_ttl.as_secs());
    }

    pub async fn is_blacklisted(&self, address: &SocketAddr) -> bool {
        self.state.read().await.is_blacklisted(address, Instant::now())
    }

    pub async fn failure_count(&self, address: &SocketAddr) -> u32 {
        self.state.read().await.failures.get(address).copied().unwrap_or(0)
    }

    pub async fn is_in_use(&self, address: &SocketAddr) -> bool {
        self.state.read().await.is_in_use(address)
    }

    /// Update the traffic counters of a live session.
    pub async fn record_traffic(&self, id: PeerId, bytes_sent: u64, bytes_received: u64) {
        if let Some(peer) = self.state.write().await.peers.get_mut(&id) {
            peer.bytes_sent = bytes_sent;
            peer.bytes_received = bytes_received;
        }
    }

    pub async fn record_ping(&self, id: PeerId, latency: Duration) {
        if let Some(peer) = self.state.write().await.peers.get_mut(&id) {
            peer.ping_latency = Some(latency);
        }
    }

    pub async fn update_peer<F>(&self, id: PeerId, update: F)
    where
        F: FnOnce(&mut PeerInfo),
    {
        if let Some(peer) = self.state.write().await.peers.get_mut(&id) {
            update(peer);
        }
    }

    pub async fn peer(&self, id: PeerId) -> Option<PeerInfo> {
        self.state.read().await.peers.get(&id).cloned()
    }

    /// Connected peers, oldest connection first.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.state.read().await.peers.values().cloned().collect();
        peers.sort_by_key(|peer| peer.id);
        peers
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.peers.len()
    }

    pub async fn connecting_count(&self) -> usize {
        self.state.read().await.connecting.len()
    }

    /// Free slots for new sessions.
    pub async fn available_slots(&self) -> usize {
        let state = self.state.read().await;
        self.config.max_connections.saturating_sub(state.peers.len() + state.connecting.len())
    }

    pub async fn total_failures(&self) -> u32 {
        self.state.read().await.failures.values().sum()
    }

    pub async fn blacklisted_count(&self) -> usize {
        let now = Instant::now();
        self.state.read().await.blacklist.values().filter(|until| **until > now).count()
    }

    /// Cumulative (sent, received) bytes over live and closed sessions.
    pub async fn total_traffic(&self) -> (u64, u64) {
        let state = self.state.read().await;
        state.peers.values().fold((state.closed_bytes_sent, state.closed_bytes_received), |(sent, received), peer| {
            (sent + peer.bytes_sent, received + peer.bytes_received)
        })
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn info(id: PeerId, address: SocketAddr) -> PeerInfo {
        PeerInfo {
            id,
            address,
            version: 70016,
            services: 0,
            user_agent: "/test/".to_string(),
            best_height: 10,
            connected_at: SystemTime::now(),
            bytes_sent: 0,
            bytes_received: 0,
            ping_latency: None,
            synced: false,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_slots_and_duplicates() {
        let pool = ConnectionPool::new(PoolConfig {
            max_connections: 2,
            ..PoolConfig::default()
        });

        let first = pool.begin_connect(addr(1)).await.unwrap();
        assert!(pool.begin_connect(addr(1)).await.is_err());
        let second = pool.begin_connect(addr(2)).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(pool.available_slots().await, 0);
        assert!(pool.begin_connect(addr(3)).await.is_err());

        pool.mark_connected(info(first, addr(1))).await;
        assert_eq!(pool.connection_count().await, 1);
        assert_eq!(pool.connecting_count().await, 1);

        assert!(pool.remove(second).await.is_none());
        assert_eq!(pool.available_slots().await, 1);
    }

    #[tokio::test]
    async fn test_failures_blacklist_host() {
        let pool = ConnectionPool::new(PoolConfig {
            max_connection_failures: 2,
            ..PoolConfig::default()
        });

        assert!(!pool.record_failure(addr(1)).await);
        assert!(!pool.record_failure(addr(1)).await);
        assert_eq!(pool.failure_count(&addr(1)).await, 2);
        assert!(pool.record_failure(addr(1)).await);

        assert!(pool.is_blacklisted(&addr(1)).await);
        assert_eq!(pool.failure_count(&addr(1)).await, 0);
        assert!(matches!(pool.begin_connect(addr(1)).await, Err(NetworkError::Blacklisted(_))));
        assert!(pool.begin_connect(addr(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_blacklist_expires() {
        let pool = ConnectionPool::new(PoolConfig {
            seed_ttl: Duration::from_millis(20),
            ..PoolConfig::default()
        });
        pool.ban(addr(1)).await;
        assert!(pool.is_blacklisted(&addr(1)).await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!pool.is_blacklisted(&addr(1)).await);
        assert!(pool.begin_connect(addr(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_traffic_survives_disconnect() {
        let pool = ConnectionPool::default();
        let id = pool.begin_connect(addr(1)).await.unwrap();
        pool.mark_connected(info(id, addr(1))).await;
        pool.record_traffic(id, 100, 250).await;
        assert_eq!(pool.total_traffic().await, (100, 250));

        pool.remove(id).await;
        assert_eq!(pool.total_traffic().await, (100, 250));
        assert!(pool.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_success_clears_failures() {
        let pool = ConnectionPool::default();
        pool.record_failure(addr(1)).await;
        let id = pool.begin_connect(addr(1)).await.unwrap();
        pool.mark_connected(info(id, addr(1))).await;
        assert_eq!(pool.failure_count(&addr(1)).await, 0);
    }
}
