//! The closed set of messages the client consumes.
//!
//! Peers may send anything the protocol allows. Everything the sync actor
//! understands is converted into a [`PeerMessage`]; any other command is
//! rejected with [`NetworkError::UnsupportedMessage`] at the session edge and
//! never reaches dispatch.

use std::net::SocketAddr;

use bitcoin::block::Header as BlockHeader;
use bitcoin::merkle_tree::MerkleBlock;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_network::{Reject, VersionMessage};
use bitcoin::{Block, Transaction};

use crate::error::NetworkError;

/// A decoded message from a peer.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    Version(VersionMessage),
    Verack,
    Headers(Vec<BlockHeader>),
    Block(Block),
    MerkleBlock(MerkleBlock),
    Tx(Transaction),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    /// Advertised addresses. Entries that do not map to a socket address are dropped.
    Addr(Vec<SocketAddr>),
    Ping(u64),
    Pong(u64),
    Reject(Reject),
}

impl PeerMessage {
    /// Wire command name.
    pub fn command(&self) -> &'static str {
        match self {
            PeerMessage::Version(_) => "version",
            PeerMessage::Verack => "verack",
            PeerMessage::Headers(_) => "headers",
            PeerMessage::Block(_) => "block",
            PeerMessage::MerkleBlock(_) => "merkleblock",
            PeerMessage::Tx(_) => "tx",
            PeerMessage::Inv(_) => "inv",
            PeerMessage::GetData(_) => "getdata",
            PeerMessage::NotFound(_) => "notfound",
            PeerMessage::Addr(_) => "addr",
            PeerMessage::Ping(_) => "ping",
            PeerMessage::Pong(_) => "pong",
            PeerMessage::Reject(_) => "reject",
        }
    }
}

impl TryFrom<NetworkMessage> for PeerMessage {
    type Error = NetworkError;

    fn try_from(message: NetworkMessage) -> Result<Self, Self::Error> {
        let message = match message {
            NetworkMessage::Version(version) => PeerMessage::Version(version),
            NetworkMessage::Verack => PeerMessage::Verack,
            NetworkMessage::Headers(headers) => PeerMessage::Headers(headers),
            NetworkMessage::Block(block) => PeerMessage::Block(block),
            NetworkMessage::MerkleBlock(merkle_block) => PeerMessage::MerkleBlock(merkle_block),
            NetworkMessage::Tx(tx) => PeerMessage::Tx(tx),
            NetworkMessage::Inv(inventory) => PeerMessage::Inv(inventory),
            NetworkMessage::GetData(inventory) => PeerMessage::GetData(inventory),
            NetworkMessage::NotFound(inventory) => PeerMessage::NotFound(inventory),
            NetworkMessage::Addr(addresses) => PeerMessage::Addr(
                addresses.into_iter().filter_map(|(_, address)| address.socket_addr().ok()).collect(),
            ),
            NetworkMessage::Ping(nonce) => PeerMessage::Ping(nonce),
            NetworkMessage::Pong(nonce) => PeerMessage::Pong(nonce),
            NetworkMessage::Reject(reject) => PeerMessage::Reject(reject),
            other => return Err(NetworkError::UnsupportedMessage(other.cmd().to_string())),
        };
        Ok(message)
    }
}
