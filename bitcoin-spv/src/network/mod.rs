//! Network layer for the Bitcoin SPV client.
//!
//! A peer session is a tokio task that owns one [`Transport`]. It connects
//! through a [`Connector`], performs the version handshake, answers pings and
//! forwards every supported message to the sync actor as a [`PeerEvent`].

pub mod connector;
pub mod constants;
pub mod discovery;
pub mod event;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod pool;
pub mod transport;

pub use connector::{Connector, TcpConnector};
pub use discovery::DnsDiscovery;
pub use event::PeerEvent;
pub use handshake::{HandshakeConfig, HandshakeManager, HandshakeState, PeerVersion};
pub use message::PeerMessage;
pub use peer::{PeerHandle, PeerSettings, spawn_peer};
pub use pool::{ConnectionPool, PoolConfig};
pub use transport::{Transport, V1Transport};
