//! Transport layer abstraction for Bitcoin P2P connections.
//!
//! A `Transport` moves whole `NetworkMessage`s over some byte stream. Peer
//! sessions only ever see this trait, so tests can run the full protocol over
//! in-memory pipes.

pub mod v1;

use std::net::SocketAddr;

use async_trait::async_trait;
use bitcoin::p2p::message::NetworkMessage;

use crate::error::NetworkResult;

pub use v1::V1Transport;

/// Abstract transport layer for P2P communication.
#[async_trait]
pub trait Transport: Send {
    /// Send a network message over the transport.
    async fn send_message(&mut self, message: NetworkMessage) -> NetworkResult<()>;

    /// Receive a network message from the transport.
    ///
    /// # Returns
    /// * `Ok(Some(message))` if a complete message was received
    /// * `Ok(None)` if the stream had to be resynchronized and no message is ready yet
    /// * `Err(NetworkError)` on failure or disconnection
    ///
    /// Implementations must be cancel safe: dropping the future between reads
    /// must not lose buffered bytes.
    async fn receive_message(&mut self) -> NetworkResult<Option<NetworkMessage>>;

    fn is_connected(&self) -> bool;

    /// Remote address, for logging and failure accounting.
    fn peer_address(&self) -> SocketAddr;

    fn bytes_sent(&self) -> u64;

    fn bytes_received(&self) -> u64;

    /// Shutdown the transport connection.
    async fn shutdown(&mut self) -> NetworkResult<()>;
}
