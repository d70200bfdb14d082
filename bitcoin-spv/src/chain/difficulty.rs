//! Compact target encoding, proof-of-work checks and difficulty retargeting.
//!
//! Targets are handled as `BigUint` so that the retarget product
//! `old_target * actual_timespan` cannot overflow.

use bitcoin::block::Header as BlockHeader;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget};
use num_bigint::BigUint;

use crate::error::{ValidationError, ValidationResult};
use crate::params::NetworkParams;

/// Decode compact `bits` into a target. Returns `None` for negative or overflowing encodings.
pub fn target_from_compact(bits: CompactTarget) -> Option<BigUint> {
    let bits = bits.to_consensus();
    let size = bits >> 24;
    let mantissa = bits & 0x007f_ffff;

    if mantissa != 0 && bits & 0x0080_0000 != 0 {
        return None;
    }
    if mantissa != 0 && (size > 34 || (mantissa > 0xff && size > 33) || (mantissa > 0xffff && size > 32)) {
        return None;
    }

    let mantissa = BigUint::from(mantissa);
    Some(if size <= 3 {
        mantissa >> (8 * (3 - size))
    } else {
        mantissa << (8 * (size - 3))
    })
}

/// Encode a target in compact form, rounding down like Bitcoin Core's `GetCompact`.
pub fn target_to_compact(target: &BigUint) -> CompactTarget {
    let mut size = target.bits().div_ceil(8) as u32;
    let mut mantissa: u32 = if size <= 3 {
        low_u32(&(target << (8 * (3 - size))))
    } else {
        low_u32(&(target >> (8 * (size - 3))))
    };

    // A set sign bit would make the value negative; move it into the exponent.
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }

    CompactTarget::from_consensus(mantissa | (size << 24))
}

fn low_u32(value: &BigUint) -> u32 {
    value.iter_u32_digits().next().unwrap_or(0)
}

/// The amount of work a block with this target represents: `2^256 / (target + 1)`.
pub fn work_for_target(target: &BigUint) -> BigUint {
    (BigUint::from(1u8) << 256u32) / (target + 1u32)
}

/// Block hashes compare as little-endian 256-bit integers.
pub fn hash_to_uint(hash: &BlockHash) -> BigUint {
    BigUint::from_bytes_le(&hash.to_byte_array())
}

/// Stateless header checks: decodable bits, target within the pow limit, hash meets target.
pub fn check_proof_of_work(header: &BlockHeader, params: &NetworkParams) -> ValidationResult<BigUint> {
    let hash = header.block_hash();
    let malformed = |reason: String| ValidationError::Malformed {
        hash,
        reason,
    };

    let target = target_from_compact(header.bits)
        .ok_or_else(|| malformed(format!("undecodable bits {:#010x}", header.bits.to_consensus())))?;

    if target == BigUint::from(0u8) {
        return Err(malformed("zero target".to_string()));
    }
    if target > params.pow_limit() {
        return Err(malformed(format!(
            "target for bits {:#010x} exceeds the network pow limit",
            header.bits.to_consensus()
        )));
    }
    if hash_to_uint(&hash) > target {
        return Err(malformed("hash does not meet target".to_string()));
    }

    Ok(target)
}

/// Expected bits for the first block of a new retarget interval.
///
/// `interval_first_time` is the timestamp of the first block of the interval that
/// just ended, `last` is the parent of the new block (last of that interval).
pub fn next_retarget_bits(params: &NetworkParams, last: &BlockHeader, interval_first_time: u32) -> CompactTarget {
    let elapsed = i64::from(last.time) - i64::from(interval_first_time);
    let actual = elapsed.clamp(i64::from(params.min_retarget_timespan), i64::from(params.max_retarget_timespan));

    let Some(old_target) = target_from_compact(last.bits) else {
        return params.pow_limit_bits;
    };

    let mut target = old_target * BigUint::from(actual as u64) / BigUint::from(params.retarget_timespan);
    let limit = params.pow_limit();
    if target > limit {
        target = limit;
    }

    target_to_compact(&target)
}
