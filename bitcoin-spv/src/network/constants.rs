//! Network constants for peer sessions

use std::time::Duration;

// Protocol
pub const PROTOCOL_VERSION: u32 = 70002;
/// Oldest peer version accepted; the first with BIP37 filtering.
pub const MIN_PROTOCOL_VERSION: u32 = 70001;
pub const USER_AGENT: &str = concat!("/bitcoin-spv:", env!("CARGO_PKG_VERSION"), "/");
pub const MAX_USER_AGENT_LEN: usize = 256;

// Connection limits
pub const MAX_CONNECTIONS: usize = 3;
pub const MAX_CONNECTION_FAILURES: u32 = 20;

// Timeouts
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const PING_INTERVAL: Duration = Duration::from_secs(120);

// Reconnection
pub const RECONNECTION_DELAY: Duration = Duration::from_secs(10);
/// How long a misbehaving or unreachable host stays blacklisted.
pub const SEED_TTL: Duration = Duration::from_secs(600);

// Peer exchange
pub const MAX_ADDR_TO_STORE: usize = 2000;

// Download
pub const MAX_HEADERS_PER_MESSAGE: usize = 2000;
pub const MAX_BLOCKS_PER_INV: usize = 500;
