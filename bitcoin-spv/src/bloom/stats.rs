//! False-positive accounting and rate adaptation

use serde::{Deserialize, Serialize};

/// Rate adaptation tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BloomRateConfig {
    /// Rate used while far behind the network.
    pub rate_min: f64,
    /// How far above `rate_min` the rate climbs as the download catches up.
    pub rate_delta: f64,
    /// Observed rate that forces a rebuild at `rate_min`.
    pub observed_rate_max: f64,
    /// Weight of a single block in the low-pass filter.
    pub low_pass_ratio: f64,
    /// Typical transaction count of a full block.
    pub txs_per_block: u32,
    /// Blocks over which the target rate ramps from `rate_min` to `rate_min + rate_delta`.
    pub ramp_blocks: u32,
}

impl Default for BloomRateConfig {
    fn default() -> Self {
        Self {
            rate_min: 0.0001,
            rate_delta: 0.0004,
            observed_rate_max: 0.005,
            low_pass_ratio: 0.01,
            txs_per_block: 600,
            ramp_blocks: 2016,
        }
    }
}

impl BloomRateConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.rate_min > 0.0 && self.rate_min + self.rate_delta < 1.0) {
            return Err("bloom rate range must lie within (0, 1)".to_string());
        }
        if self.rate_delta < 0.0 {
            return Err("bloom rate delta must not be negative".to_string());
        }
        if !(self.low_pass_ratio > 0.0 && self.low_pass_ratio <= 1.0) {
            return Err("bloom low pass ratio must lie within (0, 1]".to_string());
        }
        if self.txs_per_block == 0 || self.ramp_blocks == 0 {
            return Err("bloom txs per block and ramp blocks must be positive".to_string());
        }
        Ok(())
    }
}

/// Counters for the lifetime of a manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BloomFilterStats {
    /// Filters built and sent.
    pub reloads: u64,
    pub filtered_blocks: u64,
    pub transactions_received: u64,
    pub false_positive_transactions: u64,
    /// Low-pass filtered false-positive rate.
    pub observed_rate: f64,
}

/// Low-pass filter over the false-positive rate seen in filtered blocks.
#[derive(Debug, Clone)]
pub struct RateTracker {
    config: BloomRateConfig,
    stats: BloomFilterStats,
}

impl RateTracker {
    pub fn new(config: BloomRateConfig) -> Self {
        Self {
            config,
            stats: BloomFilterStats::default(),
        }
    }

    pub fn config(&self) -> &BloomRateConfig {
        &self.config
    }

    pub fn stats(&self) -> &BloomFilterStats {
        &self.stats
    }

    pub fn observed_rate(&self) -> f64 {
        self.stats.observed_rate
    }

    /// Rate the filter should have with `blocks_left` still to download.
    pub fn target_rate(&self, blocks_left: u32) -> f64 {
        let ramp = f64::from(self.config.ramp_blocks);
        let left = f64::from(blocks_left.min(self.config.ramp_blocks));
        self.config.rate_min + self.config.rate_delta * (ramp - left) / ramp
    }

    /// Feed one filtered block: `transactions` received, of which `false_positives`
    /// were irrelevant. Returns true when the observed rate exceeds the maximum.
    pub fn record_block(&mut self, transactions: usize, false_positives: usize) -> bool {
        let per_block = f64::from(self.config.txs_per_block);
        let ratio = self.config.low_pass_ratio;
        let txs = transactions as f64;
        let fp = false_positives as f64;

        let decay = (1.0 - ratio * txs / per_block).max(0.0);
        self.stats.observed_rate = self.stats.observed_rate * decay + ratio * fp / per_block;
        self.stats.filtered_blocks += 1;
        self.stats.transactions_received += transactions as u64;
        self.stats.false_positive_transactions += false_positives as u64;

        self.stats.observed_rate > self.config.observed_rate_max
    }

    pub fn record_reload(&mut self) {
        self.stats.reloads += 1;
    }

    pub fn reset_observed(&mut self) {
        self.stats.observed_rate = 0.0;
    }

    /// Whether a filter loaded at `loaded_rate` is too far from `target_rate`.
    pub fn is_out_of_range(&self, loaded_rate: f64, target_rate: f64) -> bool {
        (target_rate - loaded_rate).abs() > self.config.rate_delta / 4.0
    }
}
