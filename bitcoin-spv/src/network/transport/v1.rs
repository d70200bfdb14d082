//! V1 Transport - unencrypted Bitcoin P2P message framing.
//!
//! Frame layout:
//! - 4 bytes: Network magic
//! - 12 bytes: Command string
//! - 4 bytes: Payload length (little-endian)
//! - 4 bytes: Checksum (first 4 bytes of SHA256d of payload)
//! - Variable: Payload

use std::net::SocketAddr;

use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::hashes::{Hash, sha256d};
use bitcoin::p2p::Magic;
use bitcoin::p2p::message::{MAX_MSG_SIZE, NetworkMessage, RawNetworkMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Transport;
use crate::error::{NetworkError, NetworkResult};

/// Header length for V1 protocol: magic(4) + command(12) + length(4) + checksum(4)
const HEADER_LEN: usize = 24;

/// Maximum resync steps per receive call to prevent infinite loops.
const MAX_RESYNC_STEPS_PER_CALL: usize = 64;

/// Read buffer size for socket reads.
const READ_BUFFER_SIZE: usize = 8192;

/// V1 transport over any byte stream (a `TcpStream` in production, an
/// in-memory duplex in tests).
pub struct V1Transport<S> {
    stream: S,
    /// Bytes read but not yet framed. Survives cancelled receives.
    framing_buffer: Vec<u8>,
    magic: Magic,
    peer_address: SocketAddr,
    bytes_sent: u64,
    bytes_received: u64,
    connected: bool,
    consecutive_resyncs: u32,
}

/// What the buffer holds after one framing attempt.
enum Frame {
    Message(NetworkMessage),
    /// More bytes are needed.
    Incomplete,
    /// Bytes were discarded to realign; try again.
    Resynced,
}

impl<S> V1Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, magic: Magic, peer_address: SocketAddr) -> Self {
        Self {
            stream,
            framing_buffer: Vec::with_capacity(READ_BUFFER_SIZE),
            magic,
            peer_address,
            bytes_sent: 0,
            bytes_received: 0,
            connected: true,
            consecutive_resyncs: 0,
        }
    }

    pub fn consecutive_resyncs(&self) -> u32 {
        self.consecutive_resyncs
    }

    /// Read once into the framing buffer. A single `read` is cancel safe.
    async fn read_some(&mut self) -> NetworkResult<()> {
        let mut tmp = [0u8; READ_BUFFER_SIZE];
        match self.stream.read(&mut tmp).await {
            Ok(0) => {
                tracing::info!("V1Transport: Peer {} closed connection (EOF)", self.peer_address);
                self.connected = false;
                Err(NetworkError::PeerDisconnected)
            }
            Ok(n) => {
                self.framing_buffer.extend_from_slice(&tmp[..n]);
                self.bytes_received += n as u64;
                Ok(())
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::ConnectionAborted
                    || e.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                tracing::info!("V1Transport: Peer {} connection reset/aborted", self.peer_address);
                self.connected = false;
                Err(NetworkError::PeerDisconnected)
            }
            Err(e) => {
                self.connected = false;
                Err(NetworkError::ConnectionFailed(format!("Read failed: {}", e)))
            }
        }
    }

    fn try_frame(&mut self) -> NetworkResult<Frame> {
        let magic_bytes = self.magic.to_bytes();

        // Align to magic
        if self.framing_buffer.len() >= 4 && self.framing_buffer[..4] != magic_bytes {
            let dropped = match self.framing_buffer.windows(4).position(|w| w == magic_bytes) {
                Some(pos) => pos,
                // Keep the last 3 bytes in case they start a magic prefix
                None => self.framing_buffer.len() - 3,
            };
            tracing::warn!(
                "V1Transport {}: stream desync: skipping {} stray bytes before magic",
                self.peer_address,
                dropped
            );
            self.framing_buffer.drain(0..dropped);
            self.consecutive_resyncs = self.consecutive_resyncs.saturating_add(1);
            return Ok(Frame::Resynced);
        }

        if self.framing_buffer.len() < HEADER_LEN {
            return Ok(Frame::Incomplete);
        }

        let length = u32::from_le_bytes([
            self.framing_buffer[16],
            self.framing_buffer[17],
            self.framing_buffer[18],
            self.framing_buffer[19],
        ]) as usize;
        if length > MAX_MSG_SIZE {
            return Err(NetworkError::ProtocolError(format!(
                "Declared payload length {} exceeds MAX_MSG_SIZE {}",
                length, MAX_MSG_SIZE
            )));
        }
        let total_len = HEADER_LEN + length;
        if self.framing_buffer.len() < total_len {
            return Ok(Frame::Incomplete);
        }

        let header_checksum = &self.framing_buffer[20..24];
        let checksum = sha256d::Hash::hash(&self.framing_buffer[HEADER_LEN..total_len]);
        if &checksum.as_byte_array()[..4] != header_checksum {
            tracing::warn!(
                "V1Transport: Skipping message with invalid checksum from {}",
                self.peer_address
            );
            self.framing_buffer.drain(0..1);
            self.consecutive_resyncs = self.consecutive_resyncs.saturating_add(1);
            return Ok(Frame::Resynced);
        }

        let decoded = encode::deserialize::<RawNetworkMessage>(&self.framing_buffer[..total_len]);
        self.framing_buffer.drain(0..total_len);
        match decoded {
            Ok(raw_message) => {
                self.consecutive_resyncs = 0;
                if *raw_message.magic() != self.magic {
                    return Err(NetworkError::ProtocolError(format!(
                        "Wrong magic bytes: expected {}, got {}",
                        self.magic,
                        raw_message.magic()
                    )));
                }
                tracing::trace!(
                    "V1Transport: Decoded {} from {}",
                    raw_message.cmd(),
                    self.peer_address
                );
                Ok(Frame::Message(raw_message.into_payload()))
            }
            Err(e) => {
                // The frame checksummed correctly, so its boundary is trustworthy.
                tracing::warn!(
                    "V1Transport {}: dropping undecodable frame ({})",
                    self.peer_address,
                    e
                );
                Ok(Frame::Resynced)
            }
        }
    }
}

#[async_trait]
impl<S> Transport for V1Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_message(&mut self, message: NetworkMessage) -> NetworkResult<()> {
        if !self.connected {
            return Err(NetworkError::NotConnected);
        }

        let raw_message = RawNetworkMessage::new(self.magic, message);
        let serialized = encode::serialize(&raw_message);

        let written = async {
            self.stream.write_all(&serialized).await?;
            self.stream.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                self.bytes_sent += serialized.len() as u64;
                tracing::trace!("V1Transport: Sent {} to {}", raw_message.cmd(), self.peer_address);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("V1Transport: Disconnecting {} due to write error: {}", self.peer_address, e);
                self.connected = false;
                Err(NetworkError::ConnectionFailed(format!("Write failed: {}", e)))
            }
        }
    }

    async fn receive_message(&mut self) -> NetworkResult<Option<NetworkMessage>> {
        if !self.connected {
            return Err(NetworkError::NotConnected);
        }

        let mut resync_steps = 0usize;
        loop {
            match self.try_frame()? {
                Frame::Message(message) => return Ok(Some(message)),
                Frame::Resynced => {
                    resync_steps += 1;
                    if resync_steps >= MAX_RESYNC_STEPS_PER_CALL {
                        return Ok(None);
                    }
                }
                Frame::Incomplete => self.read_some().await?,
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    async fn shutdown(&mut self) -> NetworkResult<()> {
        if self.connected {
            let _ = self.stream.shutdown().await;
            self.connected = false;
            tracing::debug!("V1Transport: Shutdown connection to {}", self.peer_address);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;
    use tokio::io::{DuplexStream, duplex};

    fn pair() -> (V1Transport<DuplexStream>, V1Transport<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let magic = Magic::from(Network::Regtest);
        let addr: SocketAddr = "127.0.0.1:18444".parse().unwrap();
        (V1Transport::new(a, magic, addr), V1Transport::new(b, magic, addr))
    }

    #[test]
    fn test_header_len() {
        assert_eq!(HEADER_LEN, 4 + 12 + 4 + 4);
    }

    #[tokio::test]
    async fn test_round_trip_and_counters() {
        let (mut left, mut right) = pair();
        left.send_message(NetworkMessage::Ping(42)).await.unwrap();
        left.send_message(NetworkMessage::Verack).await.unwrap();

        assert!(matches!(right.receive_message().await.unwrap(), Some(NetworkMessage::Ping(42))));
        assert!(matches!(right.receive_message().await.unwrap(), Some(NetworkMessage::Verack)));
        assert_eq!(left.bytes_sent(), right.bytes_received());
        // ping: header + 8 byte nonce; verack: header only
        assert_eq!(left.bytes_sent(), (HEADER_LEN + 8 + HEADER_LEN) as u64);
    }

    #[tokio::test]
    async fn test_skips_garbage_before_magic() {
        let (a, mut raw) = duplex(64 * 1024);
        let magic = Magic::from(Network::Regtest);
        let addr: SocketAddr = "127.0.0.1:18444".parse().unwrap();
        let mut transport = V1Transport::new(a, magic, addr);

        let frame = encode::serialize(&RawNetworkMessage::new(magic, NetworkMessage::Pong(9)));
        raw.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x00]).await.unwrap();
        raw.write_all(&frame).await.unwrap();

        let mut received = None;
        while received.is_none() {
            received = transport.receive_message().await.unwrap();
        }
        assert!(matches!(received, Some(NetworkMessage::Pong(9))));
        assert!(transport.consecutive_resyncs() == 0);
    }

    #[tokio::test]
    async fn test_oversized_length_is_protocol_error() {
        let (a, mut raw) = duplex(64 * 1024);
        let magic = Magic::from(Network::Regtest);
        let addr: SocketAddr = "127.0.0.1:18444".parse().unwrap();
        let mut transport = V1Transport::new(a, magic, addr);

        let mut header = magic.to_bytes().to_vec();
        header.extend_from_slice(b"block\0\0\0\0\0\0\0");
        header.extend_from_slice(&((MAX_MSG_SIZE as u32) + 1).to_le_bytes());
        header.extend_from_slice(&[0; 4]);
        raw.write_all(&header).await.unwrap();

        assert!(matches!(transport.receive_message().await, Err(NetworkError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn test_eof_is_disconnect() {
        let (mut left, right) = pair();
        drop(right);
        assert!(matches!(left.receive_message().await, Err(NetworkError::PeerDisconnected)));
        assert!(!left.is_connected());
    }
}
