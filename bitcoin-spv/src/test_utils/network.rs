//! In-memory peers speaking the wire protocol.
//!
//! Each [`MockConnector::connect`] spawns a node task on the far end of a
//! duplex pipe. The node answers the handshake, `getheaders`, `getblocks`,
//! `getdata` (full and filtered blocks), `mempool` and pings from the chain
//! configured for its address. What the node receives is logged so tests can
//! assert on it. [`MockNetwork::announce_blocks`] extends a chain and pushes
//! an unsolicited `inv` to every open session at that address.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::merkle_tree::MerkleBlock;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Address, Magic, ServiceFlags};
use bitcoin::{Block, BlockHash, Transaction, Txid};
use tokio::io::{DuplexStream, duplex};
use tokio::sync::mpsc;

use crate::bloom::BloomFilter;
use crate::bloom::utils::{outpoint_to_bytes, script_push_data};
use crate::client::ClientConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::network::constants::{MAX_BLOCKS_PER_INV, MAX_HEADERS_PER_MESSAGE, PROTOCOL_VERSION};
use crate::network::{Connector, Transport, V1Transport};
use crate::params::NetworkParams;

const PIPE_CAPACITY: usize = 1 << 20;

const MSG_FILTERED_BLOCK: u32 = 3;

/// How a mock node treats requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockBehavior {
    /// Answers everything it can.
    #[default]
    Honest,
    /// Completes the handshake and answers pings, ignores everything else.
    Silent,
    /// Every connection attempt fails.
    Refuse,
}

/// The chain and behavior served at one address.
#[derive(Debug, Clone, Default)]
pub struct MockPeer {
    /// Main chain above genesis, lowest first.
    pub blocks: Vec<Block>,
    /// Height sent in `version`. Defaults to the chain length.
    pub advertised_height: Option<u32>,
    pub behavior: MockBehavior,
    /// Unconfirmed transactions offered on `mempool`.
    pub mempool: Vec<Transaction>,
}

impl MockPeer {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks,
            ..Self::default()
        }
    }

    pub fn silent(blocks: Vec<Block>) -> Self {
        Self {
            behavior: MockBehavior::Silent,
            ..Self::new(blocks)
        }
    }

    pub fn refusing() -> Self {
        Self {
            behavior: MockBehavior::Refuse,
            ..Self::default()
        }
    }

    pub fn with_advertised_height(mut self, height: u32) -> Self {
        self.advertised_height = Some(height);
        self
    }

    pub fn with_mempool(mut self, mempool: Vec<Transaction>) -> Self {
        self.mempool = mempool;
        self
    }

    fn height(&self) -> u32 {
        self.advertised_height.unwrap_or(self.blocks.len() as u32)
    }

    /// Index of the first block after the best locator match.
    fn start_index(&self, locator: &[BlockHash]) -> usize {
        locator
            .iter()
            .find_map(|hash| self.blocks.iter().position(|block| block.block_hash() == *hash).map(|i| i + 1))
            .unwrap_or(0)
    }

    fn block(&self, hash: &BlockHash) -> Option<&Block> {
        self.blocks.iter().find(|block| block.block_hash() == *hash)
    }
}

#[derive(Debug, Default)]
struct MockNetworkState {
    peers: HashMap<SocketAddr, MockPeer>,
    connection_attempts: HashMap<SocketAddr, u32>,
    /// Commands received, per address, in arrival order.
    received: HashMap<SocketAddr, Vec<String>>,
    /// Transactions pushed to us by the client.
    transactions: Vec<(SocketAddr, Transaction)>,
    /// Unsolicited messages for the open sessions, per address.
    outboxes: HashMap<SocketAddr, Vec<mpsc::UnboundedSender<NetworkMessage>>>,
}

/// A set of mock nodes addressed by socket address.
#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<MockNetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockNetworkState> {
        self.state.lock().expect("mock network lock poisoned")
    }

    pub fn add_peer(&self, address: SocketAddr, peer: MockPeer) {
        self.lock().peers.insert(address, peer);
    }

    /// Replace the chain served at `address`. Open sessions see it on their next request.
    pub fn set_blocks(&self, address: SocketAddr, blocks: Vec<Block>) {
        if let Some(peer) = self.lock().peers.get_mut(&address) {
            peer.blocks = blocks;
        }
    }

    /// Append `blocks` to the chain at `address` and announce them to its open sessions.
    pub fn announce_blocks(&self, address: SocketAddr, blocks: Vec<Block>) {
        let mut state = self.lock();
        let inventory: Vec<Inventory> = blocks.iter().map(|block| Inventory::Block(block.block_hash())).collect();
        if let Some(peer) = state.peers.get_mut(&address) {
            peer.blocks.extend(blocks);
        }
        if let Some(outboxes) = state.outboxes.get_mut(&address) {
            outboxes.retain(|outbox| outbox.send(NetworkMessage::Inv(inventory.clone())).is_ok());
        }
    }

    pub fn connector(&self, magic: Magic) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            network: self.clone(),
            magic,
        })
    }

    pub fn connection_attempts(&self, address: SocketAddr) -> u32 {
        self.lock().connection_attempts.get(&address).copied().unwrap_or(0)
    }

    pub fn received_commands(&self, address: SocketAddr) -> Vec<String> {
        self.lock().received.get(&address).cloned().unwrap_or_default()
    }

    /// How many times `address` received `command`.
    pub fn count_received(&self, address: SocketAddr, command: &str) -> usize {
        self.lock().received.get(&address).map_or(0, |commands| commands.iter().filter(|c| *c == command).count())
    }

    pub fn received_transactions(&self) -> Vec<Transaction> {
        self.lock().transactions.iter().map(|(_, tx)| tx.clone()).collect()
    }

    fn peer(&self, address: SocketAddr) -> Option<MockPeer> {
        self.lock().peers.get(&address).cloned()
    }

    fn record(&self, address: SocketAddr, command: &str) {
        self.lock().received.entry(address).or_default().push(command.to_string());
    }
}

/// Connects to the [`MockNetwork`] instead of TCP.
#[derive(Debug, Clone)]
pub struct MockConnector {
    network: MockNetwork,
    magic: Magic,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: SocketAddr) -> NetworkResult<Box<dyn Transport>> {
        let behavior = {
            let mut state = self.network.lock();
            *state.connection_attempts.entry(address).or_default() += 1;
            state.peers.get(&address).map(|peer| peer.behavior)
        };
        match behavior {
            None | Some(MockBehavior::Refuse) => {
                Err(NetworkError::ConnectionFailed(format!("connection to {} refused", address)))
            }
            Some(_) => {
                let (client, server) = duplex(PIPE_CAPACITY);
                let (outbox, inbox) = mpsc::unbounded_channel();
                self.network.lock().outboxes.entry(address).or_default().push(outbox);
                let node = MockNode {
                    network: self.network.clone(),
                    address,
                    filter: None,
                };
                tokio::spawn(node.serve(V1Transport::new(server, self.magic, address), inbox));
                Ok(Box::new(V1Transport::new(client, self.magic, address)))
            }
        }
    }
}

struct MockNode {
    network: MockNetwork,
    address: SocketAddr,
    filter: Option<BloomFilter>,
}

impl MockNode {
    async fn serve(
        mut self,
        mut transport: V1Transport<DuplexStream>,
        mut inbox: mpsc::UnboundedReceiver<NetworkMessage>,
    ) {
        loop {
            let received = tokio::select! {
                received = transport.receive_message() => received,
                Some(announcement) = inbox.recv() => {
                    if transport.send_message(announcement).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(_) => return,
            };
            self.network.record(self.address, message.cmd());
            let Some(peer) = self.network.peer(self.address) else {
                return;
            };
            for reply in self.respond(&peer, message) {
                if transport.send_message(reply).await.is_err() {
                    return;
                }
            }
        }
    }

    fn respond(&mut self, peer: &MockPeer, message: NetworkMessage) -> Vec<NetworkMessage> {
        match message {
            NetworkMessage::Version(_) => {
                vec![NetworkMessage::Version(version_message(self.address, peer.height())), NetworkMessage::Verack]
            }
            NetworkMessage::Ping(nonce) => vec![NetworkMessage::Pong(nonce)],
            _ if peer.behavior == MockBehavior::Silent => Vec::new(),
            NetworkMessage::FilterLoad(filter_load) => {
                self.filter = Some(BloomFilter::from(&filter_load));
                Vec::new()
            }
            NetworkMessage::GetHeaders(request) => {
                let start = peer.start_index(&request.locator_hashes);
                let headers = peer.blocks.iter().skip(start).take(MAX_HEADERS_PER_MESSAGE).map(|b| b.header).collect();
                vec![NetworkMessage::Headers(headers)]
            }
            NetworkMessage::GetBlocks(request) => {
                let start = peer.start_index(&request.locator_hashes);
                let inventory: Vec<Inventory> = peer
                    .blocks
                    .iter()
                    .skip(start)
                    .take(MAX_BLOCKS_PER_INV)
                    .map(|block| Inventory::Block(block.block_hash()))
                    .collect();
                if inventory.is_empty() {
                    Vec::new()
                } else {
                    vec![NetworkMessage::Inv(inventory)]
                }
            }
            NetworkMessage::GetData(items) => self.serve_data(peer, items),
            NetworkMessage::MemPool => {
                let inventory: Vec<Inventory> = peer
                    .mempool
                    .iter()
                    .filter(|tx| self.matches(tx))
                    .map(|tx| Inventory::Transaction(tx.compute_txid()))
                    .collect();
                if inventory.is_empty() {
                    Vec::new()
                } else {
                    vec![NetworkMessage::Inv(inventory)]
                }
            }
            NetworkMessage::Inv(items) => {
                let wanted: Vec<Inventory> =
                    items.into_iter().filter(|item| matches!(item, Inventory::Transaction(_))).collect();
                if wanted.is_empty() {
                    Vec::new()
                } else {
                    vec![NetworkMessage::GetData(wanted)]
                }
            }
            NetworkMessage::Tx(tx) => {
                self.network.lock().transactions.push((self.address, tx));
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn serve_data(&self, peer: &MockPeer, items: Vec<Inventory>) -> Vec<NetworkMessage> {
        let mut replies = Vec::new();
        let mut missing = Vec::new();
        for item in items {
            match item {
                Inventory::Block(hash) | Inventory::WitnessBlock(hash) => match peer.block(&hash) {
                    Some(block) => replies.push(NetworkMessage::Block(block.clone())),
                    None => missing.push(item),
                },
                Inventory::Unknown {
                    inv_type: MSG_FILTERED_BLOCK,
                    hash,
                } => match peer.block(&BlockHash::from_byte_array(hash)) {
                    Some(block) => replies.extend(self.filtered_block(block)),
                    None => missing.push(item),
                },
                Inventory::Transaction(txid) => {
                    match peer.mempool.iter().find(|tx| tx.compute_txid() == txid) {
                        Some(tx) => replies.push(NetworkMessage::Tx(tx.clone())),
                        None => missing.push(item),
                    }
                }
                other => missing.push(other),
            }
        }
        if !missing.is_empty() {
            replies.push(NetworkMessage::NotFound(missing));
        }
        replies
    }

    /// `merkleblock` followed by the matched transactions.
    fn filtered_block(&self, block: &Block) -> Vec<NetworkMessage> {
        let matched: HashSet<Txid> =
            block.txdata.iter().filter(|tx| self.matches(tx)).map(Transaction::compute_txid).collect();
        let merkle_block = MerkleBlock::from_block_with_predicate(block, |txid| matched.contains(txid));
        let mut replies = vec![NetworkMessage::MerkleBlock(merkle_block)];
        replies.extend(
            block.txdata.iter().filter(|tx| matched.contains(&tx.compute_txid())).cloned().map(NetworkMessage::Tx),
        );
        replies
    }

    fn matches(&self, tx: &Transaction) -> bool {
        let Some(filter) = &self.filter else {
            return false;
        };
        filter.contains(&tx.compute_txid().to_byte_array())
            || tx.output.iter().any(|output| {
                script_push_data(&output.script_pubkey).iter().any(|push| filter.contains(push))
            })
            || tx.input.iter().any(|input| filter.contains(&outpoint_to_bytes(&input.previous_output)))
    }
}

fn version_message(address: SocketAddr, height: u32) -> VersionMessage {
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs() as i64;
    VersionMessage {
        version: PROTOCOL_VERSION,
        services: ServiceFlags::NETWORK | ServiceFlags::BLOOM,
        timestamp,
        receiver: Address::new(&address, ServiceFlags::NONE),
        sender: Address::new(&address, ServiceFlags::NETWORK),
        nonce: rand::random(),
        user_agent: "/mock-node:0.1.0/".to_string(),
        start_height: height as i32,
        relay: true,
    }
}

/// A loopback address distinct per `n`.
pub fn test_socket_address(n: u8) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, n], 18444))
}

/// Regtest config restricted to `peers`, with timeouts short enough for tests.
pub fn test_config(peers: impl IntoIterator<Item = SocketAddr>) -> ClientConfig {
    ClientConfig::regtest()
        .with_peers(peers)
        .with_connect_timeout(Duration::from_secs(2))
        .with_handshake_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_millis(500))
        .with_reconnection_delay(Duration::from_millis(50))
        .with_ping_interval(Duration::from_secs(60))
}

/// Regtest parameters, as used by [`test_config`].
pub fn test_params() -> NetworkParams {
    NetworkParams::regtest()
}
