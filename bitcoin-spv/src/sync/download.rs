//! Download bookkeeping for the elected peer.
//!
//! Tracks the outstanding request and its deadline, blocks requested with
//! `getdata` and the filtered block whose matched transactions are still
//! arriving.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bitcoin::block::Header as BlockHeader;
use bitcoin::{BlockHash, Transaction, Txid};

use crate::types::PeerId;

/// What the download peer was last asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Headers,
    Blocks,
    /// `getdata` for announced blocks.
    Data,
}

/// A connected peer competing in the download election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionCandidate {
    pub id: PeerId,
    pub best_height: u32,
    /// Order of handshake completion; lower connected earlier.
    pub connected_seq: u64,
}

/// Highest advertised height wins; ties go to the earliest connection.
pub fn elect_download_peer(candidates: impl IntoIterator<Item = ElectionCandidate>) -> Option<PeerId> {
    candidates
        .into_iter()
        .max_by_key(|candidate| (candidate.best_height, Reverse(candidate.connected_seq)))
        .map(|candidate| candidate.id)
}

/// A `merkleblock` waiting for the transactions its partial tree matched.
#[derive(Debug, Clone)]
pub struct PendingFilteredBlock {
    header: BlockHeader,
    /// Matched txids in block order.
    expected: Vec<Txid>,
    received: HashMap<Txid, Transaction>,
}

impl PendingFilteredBlock {
    pub fn new(header: BlockHeader, matches: Vec<Txid>) -> Self {
        Self {
            header,
            expected: matches,
            received: HashMap::new(),
        }
    }

    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    pub fn expects(&self, txid: &Txid) -> bool {
        self.expected.contains(txid) && !self.received.contains_key(txid)
    }

    /// Keep `tx` if the block matched it. Returns whether it was taken.
    pub fn accept(&mut self, tx: Transaction) -> bool {
        let txid = tx.compute_txid();
        if !self.expects(&txid) {
            return false;
        }
        self.received.insert(txid, tx);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.expected.len()
    }

    pub fn missing(&self) -> usize {
        self.expected.len() - self.received.len()
    }

    /// Header and the transactions that arrived, in block order.
    pub fn into_parts(mut self) -> (BlockHeader, Vec<Transaction>) {
        let transactions = self.expected.iter().filter_map(|txid| self.received.remove(txid)).collect();
        (self.header, transactions)
    }
}

/// State of the download from the elected peer.
#[derive(Debug, Default)]
pub struct DownloadState {
    peer: Option<PeerId>,
    request: Option<RequestKind>,
    /// Last time the download peer answered or was asked something.
    last_activity: Option<Instant>,
    in_flight: HashSet<BlockHash>,
    /// Filtered block still collecting transactions, with the peer that sent it.
    pending_block: Option<(PeerId, PendingFilteredBlock)>,
}

impl DownloadState {
    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    pub fn is_download_peer(&self, peer: PeerId) -> bool {
        self.peer == Some(peer)
    }

    /// Adopt `peer` and forget everything outstanding with the previous one.
    pub fn elect(&mut self, peer: PeerId) {
        self.clear();
        self.peer = Some(peer);
    }

    pub fn clear(&mut self) {
        self.peer = None;
        self.reset_requests();
    }

    /// Forget outstanding requests but keep the peer.
    pub fn reset_requests(&mut self) {
        self.request = None;
        self.last_activity = None;
        self.in_flight.clear();
        self.pending_block = None;
    }

    pub fn request_sent(&mut self, kind: RequestKind, now: Instant) {
        self.request = Some(kind);
        self.last_activity = Some(now);
    }

    pub fn outstanding(&self) -> Option<RequestKind> {
        self.request
    }

    /// The peer answered; the deadline restarts.
    pub fn touch(&mut self, now: Instant) {
        if self.request.is_some() {
            self.last_activity = Some(now);
        }
    }

    /// The outstanding request was fully answered.
    pub fn complete_request(&mut self) {
        self.request = None;
        self.last_activity = None;
    }

    pub fn is_timed_out(&self, timeout: Duration, now: Instant) -> bool {
        self.request.is_some() && self.last_activity.is_some_and(|last| now.duration_since(last) >= timeout)
    }

    pub fn mark_in_flight(&mut self, hashes: impl IntoIterator<Item = BlockHash>) {
        self.in_flight.extend(hashes);
    }

    pub fn is_in_flight(&self, hash: &BlockHash) -> bool {
        self.in_flight.contains(hash)
    }

    /// Returns whether `hash` had been requested.
    pub fn block_arrived(&mut self, hash: &BlockHash) -> bool {
        self.in_flight.remove(hash)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pending_block(&self) -> Option<&PendingFilteredBlock> {
        self.pending_block.as_ref().map(|(_, block)| block)
    }

    pub fn pending_block_mut(&mut self) -> Option<&mut PendingFilteredBlock> {
        self.pending_block.as_mut().map(|(_, block)| block)
    }

    pub fn pending_peer(&self) -> Option<PeerId> {
        self.pending_block.as_ref().map(|(peer, _)| *peer)
    }

    pub fn set_pending_block(&mut self, peer: PeerId, block: PendingFilteredBlock) {
        self.pending_block = Some((peer, block));
    }

    pub fn take_pending_block(&mut self) -> Option<(PeerId, PendingFilteredBlock)> {
        self.pending_block.take()
    }
}
