//! Events flowing from peer tasks to the sync actor.

use std::net::SocketAddr;

use super::handshake::PeerVersion;
use super::message::PeerMessage;
use crate::error::NetworkError;
use crate::types::PeerId;

/// Events emitted by a peer session task.
///
/// Every session ends with exactly one `ConnectFailed` or `Disconnected`.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed.
    Connected {
        id: PeerId,
        address: SocketAddr,
        version: PeerVersion,
    },

    /// Connect or handshake failed; the session never became usable.
    ConnectFailed {
        id: PeerId,
        address: SocketAddr,
        error: NetworkError,
    },

    /// A supported message arrived.
    Message {
        id: PeerId,
        message: PeerMessage,
    },

    /// An established session ended. `error` is `None` for a local disconnect.
    Disconnected {
        id: PeerId,
        address: SocketAddr,
        error: Option<NetworkError>,
    },

    /// Addresses resolved from DNS seeds.
    Discovered(Vec<SocketAddr>),
}

impl PeerEvent {
    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            PeerEvent::Connected {
                id,
                address,
                version,
            } => format!("Connected({} {} height={})", id, address, version.start_height),
            PeerEvent::ConnectFailed {
                id,
                address,
                error,
            } => format!("ConnectFailed({} {}: {})", id, address, error),
            PeerEvent::Message {
                id,
                message,
            } => format!("Message({} {})", id, message.command()),
            PeerEvent::Disconnected {
                id,
                address,
                error,
            } => match error {
                Some(error) => format!("Disconnected({} {}: {})", id, address, error),
                None => format!("Disconnected({} {})", id, address),
            },
            PeerEvent::Discovered(addresses) => format!("Discovered({} addresses)", addresses.len()),
        }
    }
}
