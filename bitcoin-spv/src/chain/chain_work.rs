//! Cumulative proof-of-work used to pick the best chain.

use std::fmt;
use std::ops::Add;

use bitcoin::block::Header as BlockHeader;
use num_bigint::BigUint;

use crate::chain::difficulty::{target_from_compact, work_for_target};

/// Arbitrary precision cumulative work. Sums across long chains never wrap.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainWork(BigUint);

impl ChainWork {
    pub fn zero() -> Self {
        Self(BigUint::default())
    }

    /// Work contributed by a single header. Undecodable bits contribute nothing.
    pub fn from_header(header: &BlockHeader) -> Self {
        target_from_compact(header.bits).map(|target| Self(work_for_target(&target))).unwrap_or_default()
    }

    /// `self` plus the work of `header`.
    pub fn add_header(&self, header: &BlockHeader) -> Self {
        self + &Self::from_header(header)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigUint::default()
    }

    /// Big-endian bytes, minimal length.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        self.0.to_bytes_be()
    }

    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        Self(BigUint::from_bytes_be(bytes))
    }

    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }
}

impl From<BigUint> for ChainWork {
    fn from(value: BigUint) -> Self {
        Self(value)
    }
}

impl Add for ChainWork {
    type Output = ChainWork;

    fn add(self, rhs: ChainWork) -> ChainWork {
        ChainWork(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a ChainWork> for &'a ChainWork {
    type Output = ChainWork;

    fn add(self, rhs: &'a ChainWork) -> ChainWork {
        ChainWork(&self.0 + &rhs.0)
    }
}

impl fmt::Display for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::CompactTarget;

    fn header_with_bits(bits: u32) -> BlockHeader {
        let mut header = bitcoin::blockdata::constants::genesis_block(bitcoin::Network::Bitcoin).header;
        header.bits = CompactTarget::from_consensus(bits);
        header
    }

    #[test]
    fn test_harder_target_has_more_work() {
        let easy = ChainWork::from_header(&header_with_bits(0x1d00ffff));
        let hard = ChainWork::from_header(&header_with_bits(0x1b0404cb));
        assert!(hard > easy);
    }

    #[test]
    fn test_accumulation() {
        let header = header_with_bits(0x1d00ffff);
        let one = ChainWork::zero().add_header(&header);
        let two = one.add_header(&header);
        assert_eq!(two, &one + &one);
        assert_eq!(one.to_string(), "0x100010001");
    }

    #[test]
    fn test_bytes_roundtrip() {
        let work = ChainWork::zero().add_header(&header_with_bits(0x170331db));
        assert_eq!(ChainWork::from_be_bytes(&work.to_be_bytes()), work);
        assert!(!work.is_zero());
    }

    #[test]
    fn test_negative_bits_contribute_nothing() {
        assert!(ChainWork::from_header(&header_with_bits(0x04923456)).is_zero());
    }
}
