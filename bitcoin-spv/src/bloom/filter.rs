//! BIP37 bloom filter value.

use bitcoin::p2p::message_bloom::{BloomFlags, FilterLoad};

use crate::error::{BloomError, BloomResult};

/// Largest filter a peer accepts, in bytes.
pub const MAX_FILTER_SIZE: usize = 36_000;

/// Largest hash-function count a peer accepts.
pub const MAX_HASH_FUNCS: u32 = 50;

/// Multiplier applied to the hash index when deriving per-function seeds.
pub const HASH_SEED_MULTIPLIER: u32 = 0xFBA4_C795;

const LN2: f64 = std::f64::consts::LN_2;
const LN2_SQUARED: f64 = LN2 * LN2;

/// MurmurHash3 x86 32-bit.
pub fn murmur3(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k1 ^= u32::from(*byte) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

/// Tuning knobs for a filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BloomFilterParameters {
    pub false_positive_rate: f64,
    pub tweak: u32,
    pub flags: BloomFlags,
}

impl BloomFilterParameters {
    pub fn new(false_positive_rate: f64, tweak: u32, flags: BloomFlags) -> BloomResult<Self> {
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(BloomError::InvalidFalsePositiveRate(false_positive_rate));
        }
        Ok(Self {
            false_positive_rate,
            tweak,
            flags,
        })
    }
}

pub fn flags_from_u8(value: u8) -> BloomResult<BloomFlags> {
    match value {
        0 => Ok(BloomFlags::None),
        1 => Ok(BloomFlags::All),
        2 => Ok(BloomFlags::PubkeyOnly),
        other => Err(BloomError::InvalidFlags(other)),
    }
}

/// Optimal `(bytes, hash_funcs)` for `elements` items at `false_positive_rate`.
///
/// The bit count is rounded up to whole bytes, since peers index bits modulo
/// the byte length times eight.
pub fn optimal_size(elements: usize, false_positive_rate: f64) -> (usize, u32) {
    let n = elements.max(1) as f64;
    let bits = (-(n * false_positive_rate.ln()) / LN2_SQUARED).ceil().max(8.0);
    let bits = bits.min((MAX_FILTER_SIZE * 8) as f64);
    let bytes = (bits / 8.0).ceil() as usize;
    let hash_funcs = ((bits / n) * LN2).round().clamp(1.0, f64::from(MAX_HASH_FUNCS)) as u32;
    (bytes, hash_funcs)
}

/// An immutable filter. Build one with [`BloomFilterBuilder`](super::BloomFilterBuilder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: BloomFlags,
    /// Distinct elements inserted while building.
    elements: usize,
}

impl BloomFilter {
    /// Matches everything. Peers relay all transactions.
    pub fn full_match() -> Self {
        Self {
            data: vec![0xff],
            hash_funcs: 0,
            tweak: 0,
            flags: BloomFlags::None,
            elements: 0,
        }
    }

    /// Matches nothing.
    pub fn no_match() -> Self {
        Self {
            data: vec![0x00],
            hash_funcs: 0,
            tweak: 0,
            flags: BloomFlags::None,
            elements: 0,
        }
    }

    pub(super) fn empty(bytes: usize, hash_funcs: u32, tweak: u32, flags: BloomFlags) -> Self {
        Self {
            data: vec![0u8; bytes.clamp(1, MAX_FILTER_SIZE)],
            hash_funcs: hash_funcs.min(MAX_HASH_FUNCS),
            tweak,
            flags,
            elements: 0,
        }
    }

    fn bit_index(&self, i: u32, element: &[u8]) -> usize {
        let seed = i.wrapping_mul(HASH_SEED_MULTIPLIER).wrapping_add(self.tweak);
        murmur3(seed, element) as usize % (self.data.len() * 8)
    }

    pub(super) fn insert(&mut self, element: &[u8]) {
        for i in 0..self.hash_funcs {
            let bit = self.bit_index(i, element);
            self.data[bit >> 3] |= 1 << (bit & 7);
        }
        self.elements += 1;
    }

    pub fn contains(&self, element: &[u8]) -> bool {
        if self.is_full() {
            return true;
        }
        if self.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|i| {
            let bit = self.bit_index(i, element);
            self.data[bit >> 3] & (1 << (bit & 7)) != 0
        })
    }

    /// Every bit set.
    pub fn is_full(&self) -> bool {
        self.data.iter().all(|byte| *byte == 0xff)
    }

    /// No bit set.
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|byte| *byte == 0)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    pub fn flags(&self) -> BloomFlags {
        self.flags
    }

    pub fn elements(&self) -> usize {
        self.elements
    }

    /// `(1 - e^(-k*n/m))^k` for the inserted element count.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        if self.is_full() {
            return 1.0;
        }
        if self.elements == 0 || self.hash_funcs == 0 {
            return 0.0;
        }
        let k = f64::from(self.hash_funcs);
        let n = self.elements as f64;
        let m = (self.data.len() * 8) as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    pub fn to_filter_load(&self) -> FilterLoad {
        FilterLoad {
            filter: self.data.clone(),
            hash_funcs: self.hash_funcs,
            tweak: self.tweak,
            flags: self.flags,
        }
    }
}

impl From<&FilterLoad> for BloomFilter {
    /// The filter as a peer sees it. The element count is unknown.
    fn from(filter_load: &FilterLoad) -> Self {
        Self {
            data: filter_load.filter.clone(),
            hash_funcs: filter_load.hash_funcs.min(MAX_HASH_FUNCS),
            tweak: filter_load.tweak,
            flags: filter_load.flags,
            elements: 0,
        }
    }
}

impl From<&BloomFilter> for FilterLoad {
    fn from(filter: &BloomFilter) -> Self {
        filter.to_filter_load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_murmur3_reference_vectors() {
        assert_eq!(murmur3(0x0000_0000, &[]), 0x0000_0000);
        assert_eq!(murmur3(0xFBA4_C795, &[]), 0x6a39_6f08);
        assert_eq!(murmur3(0xffff_ffff, &[]), 0x81f1_6f39);
        assert_eq!(murmur3(0x0000_0000, &h("00")), 0x514e_28b7);
        assert_eq!(murmur3(0xFBA4_C795, &h("00")), 0xea3f_0b17);
        assert_eq!(murmur3(0x0000_0000, &h("ff")), 0xfd6c_f10d);
        assert_eq!(murmur3(0x0000_0000, &h("0011")), 0x16c6_b7ab);
        assert_eq!(murmur3(0x0000_0000, &h("001122")), 0x8eb5_1c3d);
        assert_eq!(murmur3(0x0000_0000, &h("00112233")), 0xb447_1bf8);
        assert_eq!(murmur3(0x0000_0000, &h("0011223344")), 0xe230_1fa8);
        assert_eq!(murmur3(0x0000_0000, &h("0011223344556677")), 0x8034_d2a0);
    }

    #[test]
    fn test_optimal_size_caps() {
        let (bytes, funcs) = optimal_size(1_000_000_000, 0.0001);
        assert_eq!(bytes, MAX_FILTER_SIZE);
        assert!(funcs >= 1);

        let (_, funcs) = optimal_size(1, 1e-30);
        assert_eq!(funcs, MAX_HASH_FUNCS);
    }

    #[test]
    fn test_optimal_size_small() {
        // 3 elements at 1%: 29 bits, rounded up to 4 bytes; k = round(29/3 * ln2) = 7
        assert_eq!(optimal_size(3, 0.01), (4, 7));
    }

    #[test]
    fn test_canned_filters() {
        let full = BloomFilter::full_match();
        assert!(full.is_full());
        assert!(full.contains(b"anything"));
        assert_eq!(full.to_filter_load().filter, vec![0xff]);

        let none = BloomFilter::no_match();
        assert!(none.is_empty());
        assert!(!none.contains(b"anything"));
        assert_eq!(none.estimated_false_positive_rate(), 0.0);
    }

    #[test]
    fn test_filter_load_seen_by_peer() {
        let mut filter = BloomFilter::empty(8, 5, 42, BloomFlags::All);
        filter.insert(b"watched");

        let received = BloomFilter::from(&filter.to_filter_load());
        assert!(received.contains(b"watched"));
        assert_eq!(received.tweak(), 42);
        assert_eq!(received.data(), filter.data());
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(BloomFilterParameters::new(0.0, 0, BloomFlags::All).is_err());
        assert!(BloomFilterParameters::new(1.0, 0, BloomFlags::All).is_err());
        assert!(BloomFilterParameters::new(f64::NAN, 0, BloomFlags::All).is_err());
        assert!(BloomFilterParameters::new(0.5, 0, BloomFlags::All).is_ok());
        assert_eq!(flags_from_u8(2), Ok(BloomFlags::PubkeyOnly));
        assert_eq!(flags_from_u8(3), Err(BloomError::InvalidFlags(3)));
    }
}
