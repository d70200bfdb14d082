//! Opening transports to peers.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::p2p::Magic;
use tokio::net::TcpStream;

use super::constants::CONNECT_TIMEOUT;
use super::transport::{Transport, V1Transport};
use crate::error::{NetworkError, NetworkResult};

/// Opens a [`Transport`] to a remote address.
///
/// The sync actor only ever connects through this trait, so the whole peer
/// lifecycle can run against in-memory peers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: SocketAddr) -> NetworkResult<Box<dyn Transport>>;
}

/// TCP connector with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    magic: Magic,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(magic: Magic) -> Self {
        Self {
            magic,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: SocketAddr) -> NetworkResult<Box<dyn Transport>> {
        tracing::debug!("Connecting to {} (timeout {:?})", address, self.connect_timeout);
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(NetworkError::ConnectionFailed(format!("Failed to connect to {}: {}", address, e)));
            }
            Err(_) => return Err(NetworkError::Timeout),
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY for {}: {}", address, e);
        }

        Ok(Box::new(V1Transport::new(stream, self.magic, address)))
    }
}
