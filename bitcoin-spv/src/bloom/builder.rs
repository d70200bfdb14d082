//! Bloom filter construction

use bitcoin::p2p::message_bloom::BloomFlags;
use bitcoin::{OutPoint, Script};

use super::filter::{BloomFilter, BloomFilterParameters, optimal_size};
use super::utils::{outpoint_to_bytes, script_push_data};
use crate::error::BloomResult;

/// Collects elements and produces an immutable [`BloomFilter`].
pub struct BloomFilterBuilder {
    /// Expected number of elements; the filter is sized for at least this many.
    elements: usize,
    false_positive_rate: f64,
    tweak: u32,
    flags: BloomFlags,
    data_elements: Vec<Vec<u8>>,
}

impl BloomFilterBuilder {
    pub fn new() -> Self {
        Self {
            elements: 0,
            false_positive_rate: 0.0001,
            tweak: rand::random::<u32>(),
            flags: BloomFlags::All,
            data_elements: Vec::new(),
        }
    }

    pub fn with_parameters(parameters: BloomFilterParameters) -> Self {
        Self::new()
            .false_positive_rate(parameters.false_positive_rate)
            .tweak(parameters.tweak)
            .flags(parameters.flags)
    }

    pub fn elements(mut self, elements: usize) -> Self {
        self.elements = elements;
        self
    }

    pub fn false_positive_rate(mut self, rate: f64) -> Self {
        self.false_positive_rate = rate;
        self
    }

    pub fn tweak(mut self, tweak: u32) -> Self {
        self.tweak = tweak;
        self
    }

    pub fn flags(mut self, flags: BloomFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn add_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data_elements.push(data.into());
        self
    }

    pub fn add_all(mut self, elements: impl IntoIterator<Item = Vec<u8>>) -> Self {
        self.data_elements.extend(elements);
        self
    }

    pub fn add_outpoint(self, outpoint: &OutPoint) -> Self {
        self.add_data(outpoint_to_bytes(outpoint))
    }

    /// Add every data push of `script`, which is what peers match output scripts against.
    pub fn add_script(mut self, script: &Script) -> Self {
        self.data_elements.extend(script_push_data(script));
        self
    }

    pub fn build(self) -> BloomResult<BloomFilter> {
        let parameters = BloomFilterParameters::new(self.false_positive_rate, self.tweak, self.flags)?;
        let elements = self.elements.max(self.data_elements.len());
        let (bytes, hash_funcs) = optimal_size(elements, parameters.false_positive_rate);

        let mut filter = BloomFilter::empty(bytes, hash_funcs, parameters.tweak, parameters.flags);
        for data in &self.data_elements {
            filter.insert(data);
        }
        Ok(filter)
    }
}

impl Default for BloomFilterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
