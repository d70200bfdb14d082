//! The sync actor.
//!
//! A single task owns the chain, the store, the bloom filter and the download
//! bookkeeping. It reacts to three inputs: commands from [`SyncHandle`]s,
//! [`PeerEvent`]s from the peer tasks and a periodic tick for timeouts and
//! reconnection. Everything it observes goes out as [`SpvEvent`]s.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::block::Header as BlockHeader;
use bitcoin::hashes::Hash;
use bitcoin::merkle_tree::MerkleBlock;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::{GetBlocksMessage, GetHeadersMessage, Inventory};
use bitcoin::p2p::message_network::Reject;
use bitcoin::{Block, BlockHash, Transaction, Txid};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::download::{DownloadState, ElectionCandidate, PendingFilteredBlock, RequestKind, elect_download_peer};
use super::events::{EventReceiver, SpvEvent};
use super::handle::{SyncCommand, SyncHandle};
use super::state::{SyncState, SyncTracker};
use crate::bloom::BloomFilterManager;
use crate::chain::{AddBlockOutcome, ChainEvent, ChainLocation, ChainState, StorableBlock};
use crate::client::ClientConfig;
use crate::error::{ChainError, NetworkError, SpvError, StorageResult, SyncError, ValidationError};
use crate::network::constants::{MAX_ADDR_TO_STORE, MAX_BLOCKS_PER_INV, MAX_HEADERS_PER_MESSAGE};
use crate::network::{
    ConnectionPool, Connector, DnsDiscovery, PeerEvent, PeerHandle, PeerMessage, PeerVersion, spawn_peer,
};
use crate::params::NetworkParams;
use crate::storage::BlockStore;
use crate::types::{PeerGroupStatus, PeerId};

/// `MSG_FILTERED_BLOCK` inventory type.
const MSG_FILTERED_BLOCK: u32 = 3;

/// How long `stop` waits for peer tasks to report their exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_TICK: Duration = Duration::from_secs(1);

/// A session the actor started, connected or not.
struct PeerEntry {
    handle: PeerHandle,
    /// Set once the handshake completed.
    version: Option<PeerVersion>,
    best_height: u32,
    /// Handshake completion order.
    connected_seq: u64,
    /// Disconnect requested; the session is excluded from elections.
    disconnecting: bool,
}

impl PeerEntry {
    fn is_ready(&self) -> bool {
        self.version.is_some() && !self.disconnecting
    }
}

/// Serial owner of the chain and the download.
pub struct SyncOrchestrator {
    config: ClientConfig,
    params: Arc<NetworkParams>,
    chain: ChainState,
    store: Box<dyn BlockStore>,
    /// `None` in headers-only mode.
    bloom: Option<BloomFilterManager>,
    pool: ConnectionPool,
    connector: Arc<dyn Connector>,

    peers: HashMap<PeerId, PeerEntry>,
    /// Connection candidates, configured peers first.
    addresses: Vec<SocketAddr>,
    next_address: usize,
    last_connect_attempt: Option<Instant>,
    next_connected_seq: u64,

    download: DownloadState,
    tracker: SyncTracker,
    download_requested: bool,
    /// Fast catch-up reached its timestamp; blocks are fetched from here on.
    catch_up_done: bool,

    published: HashMap<Txid, Transaction>,
    /// Loose transactions already requested or seen.
    seen_txids: HashSet<Txid>,

    running: bool,
    stopping: bool,

    commands: mpsc::UnboundedReceiver<SyncCommand>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    events: mpsc::UnboundedSender<SpvEvent>,
    shutdown: CancellationToken,
}

impl SyncOrchestrator {
    /// Load the chain from `store` and build an actor that is not running yet.
    pub fn new(
        config: ClientConfig,
        mut store: Box<dyn BlockStore>,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, SyncHandle, EventReceiver), SpvError> {
        config.validate().map_err(SpvError::Config)?;

        let params = Arc::new(config.params());
        let chain = ChainState::load(
            params.clone(),
            config.chain_state_config(),
            store.as_mut(),
            config.download_mode.fast_catch_up(),
        )?;
        let bloom = config.download_mode.uses_bloom_filter().then(|| BloomFilterManager::new(config.bloom_config()));
        let catch_up_done = match config.download_mode.fast_catch_up() {
            Some(timestamp) => chain.current_timestamp() >= timestamp,
            None => true,
        };

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let orchestrator = Self {
            pool: ConnectionPool::new(config.pool_config()),
            addresses: Vec::new(),
            next_address: 0,
            last_connect_attempt: None,
            next_connected_seq: 0,
            tracker: SyncTracker::new(chain.current_height()),
            download: DownloadState::default(),
            download_requested: false,
            catch_up_done,
            published: HashMap::new(),
            seen_txids: HashSet::new(),
            running: false,
            stopping: false,
            peers: HashMap::new(),
            commands,
            peer_events_tx,
            peer_events,
            events,
            shutdown: CancellationToken::new(),
            config,
            params,
            chain,
            store,
            bloom,
            connector,
        };
        Ok((orchestrator, SyncHandle::new(command_tx), event_rx))
    }

    /// [`new`](Self::new), then run the actor on its own task.
    pub fn spawn(
        config: ClientConfig,
        store: Box<dyn BlockStore>,
        connector: Arc<dyn Connector>,
    ) -> Result<(SyncHandle, EventReceiver, JoinHandle<()>), SpvError> {
        let (orchestrator, handle, events) = Self::new(config, store, connector)?;
        let task = tokio::spawn(orchestrator.run());
        Ok((handle, events, task))
    }

    /// Process commands, peer events and ticks until stopped.
    pub async fn run(mut self) {
        info!(
            "Sync orchestrator started on {} at height {} ({})",
            self.params.network,
            self.chain.current_height(),
            self.chain.head().hash()
        );

        let mut tick = tokio::time::interval(self.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        self.stop(None).await;
                        break;
                    }
                },
                Some(event) = self.peer_events.recv() => self.handle_peer_event(event).await,
                _ = tick.tick() => self.on_tick().await,
            }
        }

        info!("Sync orchestrator stopped");
    }

    fn tick_interval(&self) -> Duration {
        MAX_TICK.min(self.config.request_timeout / 2).min(self.config.reconnection_delay).max(Duration::from_millis(10))
    }

    fn emit(&self, event: SpvEvent) {
        trace!("Event: {}", event.description());
        let _ = self.events.send(event);
    }

    // ---------------------------------------------------------------------
    // Commands

    async fn handle_command(&mut self, command: SyncCommand) -> ControlFlow<()> {
        debug!("Command: {:?}", command);
        match command {
            SyncCommand::Start {
                peers,
            } => self.start(peers).await,
            SyncCommand::RequestDownload => {
                self.download_requested = true;
                self.start_download().await;
            }
            SyncCommand::StopDownload => {
                info!("Download stopped");
                self.download_requested = false;
                self.commit_pending_block().await;
                self.download.clear();
            }
            SyncCommand::ReconnectForDownload => self.reconnect_for_download().await,
            SyncCommand::Rescan {
                from_height,
            } => self.rescan(from_height).await,
            SyncCommand::PublishTransaction(tx) => self.publish_transaction(tx),
            SyncCommand::Watch(element) => {
                let added = self.bloom.as_mut().is_some_and(|bloom| bloom.watch(element));
                if added {
                    self.refresh_filter().await;
                }
            }
            SyncCommand::Status {
                response,
            } => {
                let _ = response.send(self.status().await);
            }
            SyncCommand::Stop {
                response,
            } => {
                self.stop(Some(response)).await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn start(&mut self, peers: Vec<SocketAddr>) {
        if self.running {
            debug!("Start requested while already running");
        }
        self.running = true;

        let configured = self.config.peers.clone();
        self.add_addresses(configured.into_iter().chain(peers));

        if self.addresses.is_empty() && !self.config.restrict_to_configured_peers {
            let params = self.params.clone();
            let events = self.peer_events_tx.clone();
            tokio::spawn(async move {
                let found = DnsDiscovery::new().discover_peers(&params).await;
                let _ = events.send(PeerEvent::Discovered(found));
            });
        }

        self.fill_connection_slots().await;
    }

    fn add_addresses(&mut self, addresses: impl IntoIterator<Item = SocketAddr>) {
        for address in addresses {
            if self.addresses.len() >= MAX_ADDR_TO_STORE {
                break;
            }
            if !self.addresses.contains(&address) {
                self.addresses.push(address);
            }
        }
    }

    async fn reconnect_for_download(&mut self) {
        let Some(peer) = self.download.peer() else {
            self.start_download().await;
            return;
        };
        info!("Reconnecting for download, dropping {}", peer);
        self.commit_pending_block().await;
        self.disconnect(peer);
        self.download.clear();
        self.start_download().await;
    }

    async fn rescan(&mut self, from_height: u32) {
        let checkpoint_height = self.params.checkpoints.last_at_or_below(from_height).height;
        self.emit(SpvEvent::RescanStarted {
            from_height,
            checkpoint_height,
        });
        info!("Rescanning from height {} (checkpoint {})", from_height, checkpoint_height);

        self.download.reset_requests();
        self.chain.reset_to_checkpoint(from_height);
        if let Err(e) = self.reset_store() {
            error!("Failed to truncate block store for rescan: {}", e);
        }
        self.tracker.reset(self.chain.current_height());
        self.catch_up_done = match self.config.download_mode.fast_catch_up() {
            Some(timestamp) => self.chain.current_timestamp() >= timestamp,
            None => true,
        };

        match self.download.peer() {
            Some(peer) => {
                let target = self.peer_height(peer).max(self.chain.current_height());
                self.tracker.start(self.chain.current_height(), target);
                self.reload_filter_if_needed();
                self.request_more(peer);
            }
            None => self.start_download().await,
        }
    }

    fn reset_store(&mut self) -> StorageResult<()> {
        self.store.truncate()?;
        self.store.set_head(self.chain.head())
    }

    fn publish_transaction(&mut self, tx: Transaction) {
        let txid = tx.compute_txid();
        info!("Publishing transaction {}", txid);
        self.published.insert(txid, tx);
        for entry in self.peers.values().filter(|entry| entry.is_ready()) {
            entry.handle.send(NetworkMessage::Inv(vec![Inventory::Transaction(txid)]));
        }
    }

    /// Snapshot of the peer group. The future does not borrow the actor.
    fn status(&self) -> impl Future<Output = PeerGroupStatus> + Send + 'static {
        let pool = self.pool.clone();
        let download_peer = self.download.peer();
        let progress = self.tracker.progress().clone();
        async move {
            let (bytes_sent, bytes_received) = pool.total_traffic().await;
            PeerGroupStatus {
                peers: pool.peers().await,
                download_peer,
                connecting: pool.connecting_count().await,
                connection_failures: pool.total_failures().await,
                blacklisted_hosts: pool.blacklisted_count().await,
                bytes_sent,
                bytes_received,
                progress,
            }
        }
    }

    async fn stop(&mut self, response: Option<oneshot::Sender<()>>) {
        info!("Stopping sync orchestrator");
        self.stopping = true;
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while !self.peers.is_empty() {
            match tokio::time::timeout_at(deadline, self.peer_events.recv()).await {
                Ok(Some(event)) => self.handle_peer_event(event).await,
                Ok(None) => break,
                Err(_) => {
                    warn!("{} peer sessions did not exit in time", self.peers.len());
                    break;
                }
            }
        }

        self.commit_pending_block().await;
        if let Err(e) = self.chain.flush(self.store.as_mut()) {
            error!("Failed to flush chain on stop: {}", e);
        }
        self.emit(SpvEvent::Stopped);
        if let Some(response) = response {
            let _ = response.send(());
        }
    }

    // ---------------------------------------------------------------------
    // Connections

    async fn on_tick(&mut self) {
        let now = Instant::now();
        if let Some(peer) = self.download.peer() {
            if self.download.is_timed_out(self.config.request_timeout, now) {
                self.on_request_timeout(peer).await;
            }
        }

        let due = self.last_connect_attempt.is_none_or(|last| now.duration_since(last) >= self.config.reconnection_delay);
        if due {
            self.fill_connection_slots().await;
        }

        let expired = self.chain.remove_expired_orphans();
        if expired > 0 {
            debug!("Expired {} orphan blocks", expired);
        }
    }

    async fn on_request_timeout(&mut self, peer: PeerId) {
        let Some(address) = self.peers.get(&peer).map(|entry| entry.handle.address()) else {
            self.download.clear();
            return;
        };
        warn!(
            "Download peer {} ({}) did not answer within {:?}, rotating",
            address, peer, self.config.request_timeout
        );
        self.pool.record_failure(address).await;
        self.commit_pending_block().await;
        self.disconnect(peer);
        self.download.clear();
        self.start_download().await;
    }

    /// Open sessions until the pool is full or candidates run out.
    async fn fill_connection_slots(&mut self) {
        if !self.running || self.stopping || self.addresses.is_empty() {
            return;
        }
        self.last_connect_attempt = Some(Instant::now());

        let mut attempts = 0;
        while attempts < self.addresses.len() && self.pool.available_slots().await > 0 {
            let address = self.addresses[self.next_address % self.addresses.len()];
            self.next_address = (self.next_address + 1) % self.addresses.len();
            attempts += 1;

            let id = match self.pool.begin_connect(address).await {
                Ok(id) => id,
                Err(NetworkError::Blacklisted(_)) => {
                    trace!("Skipping blacklisted host {}", address);
                    continue;
                }
                Err(e) => {
                    trace!("Not connecting to {}: {}", address, e);
                    continue;
                }
            };

            debug!("Connecting to {} as {}", address, id);
            let handle = spawn_peer(
                id,
                address,
                self.connector.clone(),
                self.config.peer_settings(self.chain.current_height()),
                self.pool.clone(),
                self.peer_events_tx.clone(),
                &self.shutdown,
            );
            self.peers.insert(
                id,
                PeerEntry {
                    handle,
                    version: None,
                    best_height: 0,
                    connected_seq: 0,
                    disconnecting: false,
                },
            );
        }
    }

    fn disconnect(&mut self, peer: PeerId) {
        if let Some(entry) = self.peers.get_mut(&peer) {
            entry.disconnecting = true;
            entry.handle.disconnect();
        }
    }

    fn send_to(&self, peer: PeerId, message: NetworkMessage) -> bool {
        match self.peers.get(&peer) {
            Some(entry) => entry.handle.send(message),
            None => false,
        }
    }

    fn peer_height(&self, peer: PeerId) -> u32 {
        self.peers.get(&peer).map_or(0, |entry| entry.best_height)
    }

    /// Disconnect and blacklist a peer that sent invalid data.
    async fn punish(&mut self, peer: PeerId, error: &ValidationError) {
        let Some(address) = self.peers.get(&peer).map(|entry| entry.handle.address()) else {
            return;
        };
        warn!("Peer {} ({}) sent an invalid block: {}", address, peer, error);
        self.pool.ban(address).await;
        self.disconnect(peer);
        if self.download.is_download_peer(peer) {
            self.download.clear();
            self.start_download().await;
        }
    }

    fn update_time_offset(&mut self) {
        let mut offsets: Vec<i64> =
            self.peers.values().filter_map(|entry| entry.version.as_ref().map(|v| v.time_offset)).collect();
        if offsets.is_empty() {
            return;
        }
        offsets.sort_unstable();
        self.chain.set_time_offset(offsets[offsets.len() / 2]);
    }

    // ---------------------------------------------------------------------
    // Peer events

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        trace!("Peer event: {}", event.description());
        match event {
            PeerEvent::Connected {
                id,
                address,
                version,
            } => self.on_connected(id, address, version).await,
            PeerEvent::ConnectFailed {
                id,
                address,
                error,
            } => {
                self.peers.remove(&id);
                debug!("Connection to {} failed: {}", address, error);
                if error.is_connection_failure() {
                    self.pool.record_failure(address).await;
                }
            }
            PeerEvent::Disconnected {
                id,
                address,
                error,
            } => self.on_disconnected(id, address, error).await,
            PeerEvent::Message {
                id,
                message,
            } => self.handle_message(id, message).await,
            PeerEvent::Discovered(addresses) => {
                info!("Discovered {} peer addresses", addresses.len());
                self.add_addresses(addresses);
                self.fill_connection_slots().await;
            }
        }
    }

    async fn on_connected(&mut self, id: PeerId, address: SocketAddr, version: PeerVersion) {
        let seq = self.next_connected_seq;
        self.next_connected_seq += 1;
        let Some(entry) = self.peers.get_mut(&id) else {
            return;
        };
        entry.best_height = version.start_height;
        entry.connected_seq = seq;
        entry.version = Some(version.clone());

        info!(
            "Connected to {} ({}): version {}, {}, height {}",
            address, id, version.version, version.user_agent, version.start_height
        );
        self.emit(SpvEvent::PeerConnected {
            peer: id,
            address,
            version: version.version,
            user_agent: version.user_agent,
            best_height: version.start_height,
        });
        self.update_time_offset();

        self.send_filter_to(id).await;
        for txid in self.published.keys() {
            self.send_to(id, NetworkMessage::Inv(vec![Inventory::Transaction(*txid)]));
        }

        self.start_download().await;
    }

    async fn on_disconnected(&mut self, id: PeerId, address: SocketAddr, error: Option<NetworkError>) {
        if self.download.pending_peer() == Some(id) {
            self.commit_pending_block().await;
        }
        let Some(entry) = self.peers.remove(&id) else {
            return;
        };
        if entry.version.is_some() {
            self.emit(SpvEvent::PeerDisconnected {
                peer: id,
                address,
                error: error.map(|e| e.to_string()),
            });
        }
        self.update_time_offset();

        if self.download.is_download_peer(id) {
            info!("Download peer {} disconnected, electing another", address);
            self.download.clear();
            self.start_download().await;
        }
    }

    async fn handle_message(&mut self, peer: PeerId, message: PeerMessage) {
        if !self.peers.get(&peer).is_some_and(PeerEntry::is_ready) {
            trace!("Ignoring {} from {} outside a session", message.command(), peer);
            return;
        }
        if self.download.is_download_peer(peer) {
            self.download.touch(Instant::now());
        }
        // Matched transactions follow their merkleblock; anything else ends the block.
        if !matches!(message, PeerMessage::Tx(_)) && self.download.pending_peer() == Some(peer) {
            self.commit_pending_block().await;
        }

        match message {
            PeerMessage::Version(_) | PeerMessage::Verack => {
                debug!("Ignoring repeated handshake message from {}", peer);
            }
            PeerMessage::Headers(headers) => self.on_headers(peer, headers).await,
            PeerMessage::Inv(inventory) => self.on_inv(peer, inventory).await,
            PeerMessage::MerkleBlock(merkle_block) => self.on_merkle_block(peer, merkle_block).await,
            PeerMessage::Block(block) => self.on_block(peer, block).await,
            PeerMessage::Tx(tx) => self.on_tx(peer, tx).await,
            PeerMessage::GetData(inventory) => self.on_get_data(peer, inventory),
            PeerMessage::NotFound(inventory) => {
                for item in inventory {
                    if let Some(hash) = block_hash_of(&item) {
                        self.download.block_arrived(&hash);
                    }
                }
                self.check_data_complete(peer).await;
            }
            PeerMessage::Addr(addresses) => {
                if !self.config.restrict_to_configured_peers {
                    trace!("Received {} addresses from {}", addresses.len(), peer);
                    self.add_addresses(addresses);
                }
            }
            // Barrier after getdata; the pending block was committed above.
            PeerMessage::Pong(_) => self.check_data_complete(peer).await,
            PeerMessage::Ping(_) => {}
            PeerMessage::Reject(reject) => self.on_reject(peer, reject),
        }
    }

    fn on_reject(&self, peer: PeerId, reject: Reject) {
        warn!("Peer {} rejected {}: {:?} {}", peer, reject.message, reject.ccode, reject.reason);
        self.emit(SpvEvent::RejectReceived {
            peer,
            message: reject.message.to_string(),
            code: reject.ccode,
            reason: reject.reason.to_string(),
            hash: reject.hash,
        });
    }

    fn on_get_data(&self, peer: PeerId, inventory: Vec<Inventory>) {
        let mut missing = Vec::new();
        for item in inventory {
            let txid = match item {
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => txid,
                other => {
                    missing.push(other);
                    continue;
                }
            };
            match self.published.get(&txid) {
                Some(tx) => {
                    debug!("Serving transaction {} to {}", txid, peer);
                    self.send_to(peer, NetworkMessage::Tx(tx.clone()));
                }
                None => missing.push(item),
            }
        }
        if !missing.is_empty() {
            self.send_to(peer, NetworkMessage::NotFound(missing));
        }
    }

    // ---------------------------------------------------------------------
    // Download

    /// Elect a download peer if none is active and send the first request.
    async fn start_download(&mut self) {
        if !self.download_requested || self.stopping || self.download.peer().is_some() {
            return;
        }
        let candidates = self.peers.iter().filter(|(_, entry)| entry.is_ready()).map(|(id, entry)| ElectionCandidate {
            id: *id,
            best_height: entry.best_height,
            connected_seq: entry.connected_seq,
        });
        let Some(peer) = elect_download_peer(candidates) else {
            debug!("No connected peer to download from");
            return;
        };
        self.download.elect(peer);

        let current = self.chain.current_height();
        let peer_height = self.peer_height(peer);
        let target = peer_height.max(current);
        self.tracker.start(current, target);
        let address = self.peers.get(&peer).map(|entry| entry.handle.address());
        if let Some(address) = address {
            info!("Downloading from {} ({}): height {} to {}", address, peer, current, target);
            self.emit(SpvEvent::DownloadStarted {
                peer,
                address,
                from_height: current,
                target_height: target,
            });
        }

        // The target rate depends on how far behind we are, now known. No
        // request is outstanding yet, so the reload leaves the download alone.
        self.reload_filter_if_needed();
        if current >= peer_height {
            self.finish_download(peer).await;
        } else {
            self.request_more(peer);
        }
    }

    /// Whether the next request is `getheaders` rather than `getblocks`.
    fn wants_headers(&self) -> bool {
        if self.bloom.is_none() {
            return true;
        }
        !self.catch_up_done && self.config.download_mode.wants_headers(self.chain.current_timestamp())
    }

    /// Ask `peer` for what follows the current head.
    fn request_more(&mut self, peer: PeerId) {
        if self.stopping {
            return;
        }
        let locator = self.chain.current_locator().into_hashes();
        let (message, kind) = if self.wants_headers() {
            (NetworkMessage::GetHeaders(GetHeadersMessage::new(locator, BlockHash::all_zeros())), RequestKind::Headers)
        } else {
            (NetworkMessage::GetBlocks(GetBlocksMessage::new(locator, BlockHash::all_zeros())), RequestKind::Blocks)
        };
        trace!("Requesting {:?} from {} at height {}", kind, peer, self.chain.current_height());
        if self.send_to(peer, message) {
            self.download.request_sent(kind, Instant::now());
        }
    }

    /// The outstanding request was answered: ask for more or finish.
    async fn continue_download(&mut self, peer: PeerId, progressed: bool) {
        self.download.complete_request();
        if progressed && self.chain.current_height() < self.tracker.target_height() {
            self.request_more(peer);
        } else {
            self.finish_download(peer).await;
        }
    }

    async fn finish_download(&mut self, peer: PeerId) {
        self.download.complete_request();
        if self.tracker.is_synced() {
            return;
        }
        let height = self.chain.current_height();
        self.tracker.mark_synced(height);
        self.pool.update_peer(peer, |info| info.synced = true).await;
        info!("Download finished at height {}", height);
        self.emit(SpvEvent::DownloadFinished {
            peer,
            height,
        });

        if self.bloom.as_ref().is_some_and(|bloom| bloom.loaded_filter().is_some()) {
            self.send_to(peer, NetworkMessage::MemPool);
        }
    }

    async fn on_headers(&mut self, peer: PeerId, headers: Vec<BlockHeader>) {
        if !self.download.is_download_peer(peer) {
            if self.tracker.is_synced() && self.wants_headers() {
                self.on_announced_headers(peer, headers).await;
            } else {
                trace!("Ignoring {} headers from {}", headers.len(), peer);
            }
            return;
        }
        let received = headers.len();
        let catch_up = self.config.download_mode.fast_catch_up();
        let mut added = 0usize;
        let mut orphaned = false;
        let mut switched = false;

        for header in headers {
            if !self.catch_up_done && catch_up.is_some_and(|timestamp| header.time >= timestamp) {
                info!("Fast catch-up reached at height {}, switching to filtered blocks", self.chain.current_height());
                self.catch_up_done = true;
                switched = true;
                break;
            }
            let Some(outcome) = self.integrate(peer, header, None).await else {
                return;
            };
            if outcome.location == ChainLocation::Orphan {
                orphaned = true;
                break;
            }
            if !outcome.duplicate {
                added += 1 + outcome.connected_orphans.len();
            }
        }

        self.after_batch(added, false);
        if orphaned || switched || (received == MAX_HEADERS_PER_MESSAGE && added > 0) {
            self.download.complete_request();
            self.request_more(peer);
        } else {
            self.continue_download(peer, added > 0).await;
        }
    }

    /// Headers another peer sent for blocks it announced while we are synced.
    async fn on_announced_headers(&mut self, peer: PeerId, headers: Vec<BlockHeader>) {
        let mut added = 0usize;
        let mut reorganized = false;
        for header in headers {
            let Some(outcome) = self.integrate(peer, header, None).await else {
                return;
            };
            if outcome.location == ChainLocation::Orphan {
                break;
            }
            if !outcome.duplicate {
                added += 1 + outcome.connected_orphans.len();
            }
            reorganized |= outcome.reorganization().is_some();
        }
        self.after_batch(added, reorganized);
    }

    async fn on_inv(&mut self, peer: PeerId, inventory: Vec<Inventory>) {
        let mut blocks = Vec::new();
        let mut transactions = Vec::new();
        for item in &inventory {
            match item {
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => transactions.push(*txid),
                item => {
                    if let Some(hash) = block_hash_of(item) {
                        blocks.push(hash);
                    }
                }
            }
        }

        if !transactions.is_empty() && self.bloom.as_ref().is_some_and(|bloom| bloom.loaded_filter().is_some()) {
            let wanted: Vec<Inventory> = transactions
                .into_iter()
                .filter(|txid| self.seen_txids.insert(*txid))
                .map(Inventory::Transaction)
                .collect();
            if !wanted.is_empty() {
                self.send_to(peer, NetworkMessage::GetData(wanted));
            }
        }

        if blocks.is_empty() {
            return;
        }
        let is_download = self.download.is_download_peer(peer);
        if !is_download && !self.tracker.is_synced() {
            trace!("Ignoring {} block announcements from {} during download", blocks.len(), peer);
            return;
        }
        if let Some(entry) = self.peers.get_mut(&peer) {
            if !is_download {
                entry.best_height = entry.best_height.max(self.chain.current_height() + blocks.len() as u32);
            }
        }

        let wanted: Vec<BlockHash> = blocks
            .into_iter()
            .filter(|hash| self.chain.location_of(hash) == ChainLocation::None && !self.download.is_in_flight(hash))
            .collect();
        if wanted.is_empty() {
            if is_download && self.download.outstanding() == Some(RequestKind::Blocks) {
                // Nothing new in the answer to getblocks.
                self.finish_download(peer).await;
            }
            return;
        }
        if is_download {
            self.tracker.raise_target(self.chain.current_height() + wanted.len().min(MAX_BLOCKS_PER_INV) as u32);
        }

        if self.wants_headers() {
            // Without a filter only headers are stored, so fetch those.
            if !is_download {
                let locator = self.chain.current_locator().into_hashes();
                debug!("Requesting headers for {} announced blocks from {}", wanted.len(), peer);
                self.send_to(peer, NetworkMessage::GetHeaders(GetHeadersMessage::new(locator, BlockHash::all_zeros())));
            } else if self.download.outstanding().is_none() {
                self.request_more(peer);
            }
            return;
        }

        let filtered = self.bloom.as_ref().is_some_and(|bloom| bloom.loaded_filter().is_some());
        let items = wanted
            .iter()
            .map(|hash| {
                if filtered {
                    Inventory::Unknown {
                        inv_type: MSG_FILTERED_BLOCK,
                        hash: hash.to_byte_array(),
                    }
                } else {
                    Inventory::Block(*hash)
                }
            })
            .collect();
        debug!("Requesting {} blocks from {}", wanted.len(), peer);
        if self.send_to(peer, NetworkMessage::GetData(items)) {
            self.download.mark_in_flight(wanted);
            // The pong marks the end of the answers to this getdata.
            self.send_to(peer, NetworkMessage::Ping(rand::random()));
            if is_download {
                self.download.request_sent(RequestKind::Data, Instant::now());
            }
        }
    }

    async fn on_merkle_block(&mut self, peer: PeerId, merkle_block: MerkleBlock) {
        let hash = merkle_block.header.block_hash();
        let requested = self.download.block_arrived(&hash);
        if !requested && !self.tracker.is_synced() {
            trace!("Dropping unrequested merkle block {} from {}", hash, peer);
            return;
        }

        let mut matches = Vec::new();
        let mut indexes = Vec::new();
        if let Err(e) = merkle_block.extract_matches(&mut matches, &mut indexes) {
            let error = ValidationError::InvalidPartialMerkleTree {
                hash,
                reason: format!("{:?}", e),
            };
            self.punish(peer, &error).await;
            return;
        }

        if matches.is_empty() {
            self.commit_block(peer, merkle_block.header, Vec::new(), true).await;
            self.check_data_complete(peer).await;
        } else {
            trace!("Merkle block {} matched {} transactions", hash, matches.len());
            self.download.set_pending_block(peer, PendingFilteredBlock::new(merkle_block.header, matches));
        }
    }

    async fn on_block(&mut self, peer: PeerId, block: Block) {
        let hash = block.block_hash();
        let requested = self.download.block_arrived(&hash);
        if !requested && !self.tracker.is_synced() {
            trace!("Dropping unrequested block {} from {}", hash, peer);
            return;
        }
        let relevant: Vec<Transaction> = match &self.bloom {
            Some(bloom) => block.txdata.into_iter().filter(|tx| bloom.is_relevant(tx)).collect(),
            None => Vec::new(),
        };
        self.commit_block(peer, block.header, relevant, false).await;
        self.check_data_complete(peer).await;
    }

    async fn on_tx(&mut self, peer: PeerId, tx: Transaction) {
        if let Some(pending) = self.download.pending_block_mut() {
            if pending.accept(tx.clone()) {
                if pending.is_complete() {
                    self.commit_pending_block().await;
                    self.check_data_complete(peer).await;
                }
                return;
            }
        }

        let txid = tx.compute_txid();
        self.seen_txids.insert(txid);
        let relevant = self.bloom.as_mut().is_some_and(|bloom| bloom.register_transaction(&tx));
        if relevant {
            info!("Received unconfirmed transaction {} from {}", txid, peer);
            self.emit(SpvEvent::TransactionReceived {
                tx,
                block: None,
            });
            self.refresh_filter().await;
        } else {
            trace!("Ignoring irrelevant transaction {} from {}", txid, peer);
        }
    }

    async fn commit_pending_block(&mut self) {
        let Some((peer, pending)) = self.download.take_pending_block() else {
            return;
        };
        if !pending.is_complete() {
            debug!("Committing block {} with {} matched transactions missing", pending.block_hash(), pending.missing());
        }
        let (header, transactions) = pending.into_parts();
        self.commit_block(peer, header, transactions, true).await;
    }

    /// Integrate a downloaded block with its relevant transactions.
    async fn commit_block(&mut self, peer: PeerId, header: BlockHeader, transactions: Vec<Transaction>, filtered: bool) {
        if filtered {
            if let Some(bloom) = self.bloom.as_mut() {
                bloom.record_filtered_block(&transactions);
            }
        }
        let Some(outcome) = self.integrate(peer, header, Some(transactions)).await else {
            return;
        };

        if outcome.location == ChainLocation::Orphan {
            if self.download.is_download_peer(peer) {
                debug!("Orphan block {} from download peer, requesting from locator", outcome.hash);
                self.download.reset_requests();
                self.request_more(peer);
            }
            return;
        }
        if outcome.duplicate {
            return;
        }

        let placed: Vec<&StorableBlock> = outcome.block.iter().chain(outcome.connected_orphans.iter()).collect();
        for block in &placed {
            self.report_transactions(block);
        }
        self.after_batch(placed.len(), outcome.reorganization().is_some());
        // The block was taken out of the pending slot, so nothing is lost by reloading here.
        self.reload_filter_if_needed();
    }

    fn report_transactions(&mut self, block: &StorableBlock) {
        let Some(bloom) = self.bloom.as_mut() else {
            return;
        };
        let Some(transactions) = block.transactions() else {
            return;
        };
        let mut relevant = Vec::new();
        for tx in transactions {
            if bloom.register_transaction(tx) {
                relevant.push(tx.clone());
            }
        }
        for tx in relevant {
            debug!("Transaction {} confirmed in block {} at {}", tx.compute_txid(), block.hash(), block.height());
            self.emit(SpvEvent::TransactionReceived {
                tx,
                block: Some((block.hash(), block.height())),
            });
        }
    }

    /// Continue once every block of the last getdata is in.
    async fn check_data_complete(&mut self, peer: PeerId) {
        if !self.download.is_download_peer(peer)
            || self.download.outstanding() != Some(RequestKind::Data)
            || self.download.in_flight_len() > 0
            || self.download.pending_block().is_some()
        {
            return;
        }
        if self.tracker.is_synced() {
            self.download.complete_request();
            return;
        }
        self.continue_download(peer, true).await;
    }

    /// Run `add_block` and publish what it changed. `None` when the block was refused.
    async fn integrate(
        &mut self,
        peer: PeerId,
        header: BlockHeader,
        transactions: Option<Vec<Transaction>>,
    ) -> Option<AddBlockOutcome> {
        match self.chain.add_block(header, transactions) {
            Ok(outcome) => {
                for event in &outcome.events {
                    self.publish_chain_event(event);
                }
                if let Err(e) = self.persist(&outcome) {
                    error!("Failed to persist block {}: {}", outcome.hash, e);
                }
                Some(outcome)
            }
            Err(ChainError::Validation(e)) => {
                self.punish(peer, &e).await;
                None
            }
            Err(e) => {
                error!("Download from {} cannot continue: {}", peer, e);
                let is_download = self.download.is_download_peer(peer);
                if is_download {
                    self.download.clear();
                }
                self.emit(SpvEvent::DownloadFailed {
                    peer: Some(peer),
                    error: SyncError::from(e),
                });
                None
            }
        }
    }

    fn publish_chain_event(&self, event: &ChainEvent) {
        match event {
            ChainEvent::BlockAdded {
                block,
                location,
            } => self.emit(SpvEvent::BlockAdded {
                hash: block.hash(),
                height: block.height(),
                location: *location,
            }),
            ChainEvent::Reorganized(reorg) => {
                info!(
                    "Reorganization at height {}: {} blocks replaced by {}",
                    reorg.ancestor.height(),
                    reorg.old_blocks.len(),
                    reorg.new_blocks.len()
                );
                self.emit(SpvEvent::Reorganized(reorg.clone()));
            }
        }
    }

    /// Mirror main-chain changes into the store.
    fn persist(&mut self, outcome: &AddBlockOutcome) -> StorageResult<()> {
        let mut changed = false;
        for event in &outcome.events {
            match event {
                ChainEvent::BlockAdded {
                    block,
                    location: ChainLocation::Main,
                } => {
                    self.store.put(block.clone())?;
                    changed = true;
                }
                ChainEvent::BlockAdded {
                    ..
                } => {}
                ChainEvent::Reorganized(reorg) => {
                    self.store.remove_above(reorg.ancestor.height())?;
                    for block in &reorg.new_blocks {
                        self.store.put(block.clone())?;
                    }
                    changed = true;
                }
            }
        }
        if changed {
            self.store.set_head(self.chain.head())?;
        }
        Ok(())
    }

    /// Progress bookkeeping after integrating `added` blocks.
    fn after_batch(&mut self, added: usize, reorganized: bool) {
        if added == 0 {
            return;
        }
        let height = self.chain.current_height();
        self.tracker.record_blocks(height, added, reorganized);
        self.chain.truncate();
        self.emit(SpvEvent::DownloadProgress {
            current_height: height,
            target_height: self.tracker.target_height(),
        });
    }

    // ---------------------------------------------------------------------
    // Bloom filter

    /// Blocks left as seen by the rate ramp. Before any download target is
    /// known we assume the chain is far behind, which selects `rate_min`.
    fn filter_blocks_left(&self) -> u32 {
        match self.tracker.state() {
            SyncState::Empty => u32::MAX,
            _ => self.tracker.blocks_left(),
        }
    }

    fn filter_needs_reload(&self) -> bool {
        let blocks_left = self.filter_blocks_left();
        self.bloom.as_ref().is_some_and(|bloom| bloom.needs_reload(blocks_left))
    }

    /// Give a newly connected peer the filter every other peer has.
    async fn send_filter_to(&mut self, peer: PeerId) {
        if self.filter_needs_reload() {
            // Broadcasts to every ready peer, `peer` included.
            self.refresh_filter().await;
            return;
        }
        let filter_load =
            self.bloom.as_ref().and_then(|bloom| bloom.loaded_filter()).map(|filter| filter.to_filter_load());
        if let Some(filter_load) = filter_load {
            self.send_to(peer, NetworkMessage::FilterLoad(filter_load));
        }
    }

    /// Commit the block being assembled, then reload the filter if needed.
    ///
    /// The reload restarts outstanding requests, which would discard a
    /// partially assembled filtered block.
    async fn refresh_filter(&mut self) {
        if !self.filter_needs_reload() {
            return;
        }
        self.commit_pending_block().await;
        self.reload_filter_if_needed();
    }

    /// Rebuild and send the filter to every ready peer if the watched set or
    /// the rate changed. Callers must not hold a pending filtered block.
    ///
    /// Blocks already requested were filtered with the old filter, so a
    /// download with more to fetch restarts from the locator.
    fn reload_filter_if_needed(&mut self) {
        let blocks_left = self.filter_blocks_left();
        let Some(bloom) = self.bloom.as_mut() else {
            return;
        };
        let Some(reason) = bloom.reload_reason(blocks_left) else {
            return;
        };
        let filter_load = match bloom.filter_load(blocks_left) {
            Ok(filter_load) => filter_load,
            Err(e) => {
                error!("Failed to rebuild bloom filter: {}", e);
                return;
            }
        };
        info!("Reloading bloom filter ({:?})", reason);
        for entry in self.peers.values().filter(|entry| entry.is_ready()) {
            entry.handle.send(NetworkMessage::FilterLoad(filter_load.clone()));
        }

        let Some(peer) = self.download.peer() else {
            return;
        };
        if self.download.outstanding().is_some() && self.chain.current_height() < self.tracker.target_height() {
            self.download.reset_requests();
            self.request_more(peer);
        }
    }
}

/// Block hash announced or requested by `item`, if it names a block.
fn block_hash_of(item: &Inventory) -> Option<BlockHash> {
    match item {
        Inventory::Block(hash) | Inventory::WitnessBlock(hash) | Inventory::CompactBlock(hash) => Some(*hash),
        Inventory::Unknown {
            inv_type: MSG_FILTERED_BLOCK,
            hash,
        } => Some(BlockHash::from_byte_array(*hash)),
        _ => None,
    }
}
