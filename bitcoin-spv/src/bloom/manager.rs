//! Bloom filter lifecycle management for SPV clients

use std::collections::HashSet;

use bitcoin::hashes::Hash;
use bitcoin::p2p::message_bloom::{BloomFlags, FilterLoad};
use bitcoin::{OutPoint, Script, Transaction};
use tracing::{debug, info};

use super::builder::BloomFilterBuilder;
use super::filter::BloomFilter;
use super::stats::{BloomFilterStats, BloomRateConfig, RateTracker};
use super::utils::{outpoint_to_bytes, script_push_data};
use crate::error::BloomResult;

#[derive(Debug, Clone)]
pub struct BloomFilterConfig {
    pub rate: BloomRateConfig,
    pub flags: BloomFlags,
    /// Fixed tweak. A random one is drawn per session when `None`.
    pub tweak: Option<u32>,
}

impl Default for BloomFilterConfig {
    fn default() -> Self {
        Self {
            rate: BloomRateConfig::default(),
            flags: BloomFlags::All,
            tweak: None,
        }
    }
}

/// Why a filter has to be (re)sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadReason {
    Initial,
    WatchedSetGrew,
    ObservedRateExceeded,
    TargetRateMoved,
}

/// Owns the watched set and decides when the loaded filter must be replaced.
///
/// Lives inside the sync actor; not shared.
pub struct BloomFilterManager {
    config: BloomFilterConfig,
    tweak: u32,
    /// Insertion order is kept so rebuilt filters are deterministic.
    watched: Vec<Vec<u8>>,
    watched_index: HashSet<Vec<u8>>,
    tracker: RateTracker,
    loaded: Option<BloomFilter>,
    loaded_rate: f64,
    pending: Option<ReloadReason>,
    /// Set after an observed-rate rebuild; holds the rate at `rate_min`
    /// until the download completes.
    capped: bool,
}

impl BloomFilterManager {
    pub fn new(config: BloomFilterConfig) -> Self {
        let tweak = config.tweak.unwrap_or_else(rand::random::<u32>);
        Self {
            tracker: RateTracker::new(config.rate),
            config,
            tweak,
            watched: Vec::new(),
            watched_index: HashSet::new(),
            loaded: None,
            loaded_rate: 0.0,
            pending: Some(ReloadReason::Initial),
            capped: false,
        }
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    pub fn stats(&self) -> &BloomFilterStats {
        self.tracker.stats()
    }

    pub fn loaded_filter(&self) -> Option<&BloomFilter> {
        self.loaded.as_ref()
    }

    pub fn loaded_rate(&self) -> f64 {
        self.loaded_rate
    }

    pub fn observed_rate(&self) -> f64 {
        self.tracker.observed_rate()
    }

    pub fn target_rate(&self, blocks_left: u32) -> f64 {
        if self.capped && blocks_left > 0 {
            return self.config.rate.rate_min;
        }
        self.tracker.target_rate(blocks_left)
    }

    pub fn watched_len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_watching(&self, element: &[u8]) -> bool {
        self.watched_index.contains(element)
    }

    /// Add a raw element. Returns false if it was already watched.
    pub fn watch(&mut self, element: impl Into<Vec<u8>>) -> bool {
        let element = element.into();
        if element.is_empty() || !self.watched_index.insert(element.clone()) {
            return false;
        }
        self.watched.push(element);
        self.pending.get_or_insert(ReloadReason::WatchedSetGrew);
        true
    }

    pub fn watch_outpoint(&mut self, outpoint: &OutPoint) -> bool {
        self.watch(outpoint_to_bytes(outpoint))
    }

    /// Watch every data push of `script`. Returns how many were new.
    pub fn watch_script(&mut self, script: &Script) -> usize {
        script_push_data(script).into_iter().filter(|push| self.watch(push.clone())).count()
    }

    /// Exact match of `tx` against the watched set.
    pub fn is_relevant(&self, tx: &Transaction) -> bool {
        let txid = tx.compute_txid();
        if self.is_watching(txid.as_byte_array()) {
            return true;
        }
        let output_match = tx.output.iter().any(|output| {
            script_push_data(&output.script_pubkey).iter().any(|push| self.is_watching(push))
        });
        if output_match {
            return true;
        }
        tx.input.iter().any(|input| {
            self.is_watching(&outpoint_to_bytes(&input.previous_output))
                || script_push_data(&input.script_sig).iter().any(|push| self.is_watching(push))
                || input.witness.iter().any(|item| self.is_watching(item))
        })
    }

    /// Check `tx` and, if relevant, watch its matching outputs so spends are seen.
    ///
    /// Returns whether the transaction was relevant.
    pub fn register_transaction(&mut self, tx: &Transaction) -> bool {
        if !self.is_relevant(tx) {
            return false;
        }
        if matches!(self.config.flags, BloomFlags::None) {
            return true;
        }

        let txid = tx.compute_txid();
        let matched: Vec<OutPoint> = tx
            .output
            .iter()
            .enumerate()
            .filter(|(_, output)| {
                script_push_data(&output.script_pubkey).iter().any(|push| self.is_watching(push))
            })
            .map(|(vout, _)| OutPoint {
                txid,
                vout: vout as u32,
            })
            .collect();
        for outpoint in &matched {
            self.watch_outpoint(outpoint);
        }
        true
    }

    /// Account for one filtered block whose matched `transactions` arrived.
    pub fn record_filtered_block<'a>(&mut self, transactions: impl IntoIterator<Item = &'a Transaction>) {
        let mut total = 0usize;
        let mut false_positives = 0usize;
        for tx in transactions {
            total += 1;
            if !self.is_relevant(tx) {
                false_positives += 1;
            }
        }

        if self.tracker.record_block(total, false_positives) {
            info!(
                "Observed bloom false positive rate {:.6} exceeds {:.6}, rebuilding filter",
                self.tracker.observed_rate(),
                self.config.rate.observed_rate_max
            );
            self.pending = Some(ReloadReason::ObservedRateExceeded);
        }
    }

    /// Why the filter needs to be replaced now, if it does.
    pub fn reload_reason(&self, blocks_left: u32) -> Option<ReloadReason> {
        if let Some(reason) = self.pending {
            return Some(reason);
        }
        self.tracker
            .is_out_of_range(self.loaded_rate, self.target_rate(blocks_left))
            .then_some(ReloadReason::TargetRateMoved)
    }

    pub fn needs_reload(&self, blocks_left: u32) -> bool {
        self.reload_reason(blocks_left).is_some()
    }

    /// Build the filter for the current watched set and mark it loaded.
    pub fn build_filter(&mut self, blocks_left: u32) -> BloomResult<BloomFilter> {
        let reason = self.reload_reason(blocks_left);
        if reason == Some(ReloadReason::ObservedRateExceeded) {
            self.tracker.reset_observed();
            self.capped = true;
        } else if blocks_left == 0 {
            self.capped = false;
        }
        let rate = self.target_rate(blocks_left);

        let filter = BloomFilterBuilder::new()
            .false_positive_rate(rate)
            .tweak(self.tweak)
            .flags(self.config.flags)
            .add_all(self.watched.iter().cloned())
            .build()?;

        debug!(
            "Built bloom filter: {} elements, {} bytes, {} hash functions, rate {:.6} (estimated {:.6})",
            filter.elements(),
            filter.size(),
            filter.hash_funcs(),
            rate,
            filter.estimated_false_positive_rate()
        );

        self.tracker.record_reload();
        self.loaded = Some(filter.clone());
        self.loaded_rate = rate;
        self.pending = None;
        Ok(filter)
    }

    /// `build_filter` as a wire message.
    pub fn filter_load(&mut self, blocks_left: u32) -> BloomResult<FilterLoad> {
        Ok(self.build_filter(blocks_left)?.to_filter_load())
    }
}
