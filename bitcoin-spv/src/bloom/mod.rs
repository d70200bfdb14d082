//! BIP37 bloom filters for SPV clients

pub mod builder;
pub mod filter;
pub mod manager;
pub mod stats;
pub mod utils;

#[cfg(test)]
mod tests;

pub use builder::BloomFilterBuilder;
pub use filter::{BloomFilter, BloomFilterParameters, MAX_FILTER_SIZE, MAX_HASH_FUNCS, murmur3};
pub use manager::{BloomFilterConfig, BloomFilterManager, ReloadReason};
pub use stats::{BloomFilterStats, BloomRateConfig, RateTracker};
