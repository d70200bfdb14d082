//! Element extraction shared by the builder and the relevance check

use bitcoin::consensus::encode::serialize;
use bitcoin::script::Instruction;
use bitcoin::{OutPoint, Script};

/// Serialized outpoint: 32-byte txid followed by the little-endian vout.
pub fn outpoint_to_bytes(outpoint: &OutPoint) -> Vec<u8> {
    serialize(outpoint)
}

/// Non-empty data pushes of `script`, in order. Unparseable tails are ignored.
pub fn script_push_data(script: &Script) -> Vec<Vec<u8>> {
    script
        .instructions()
        .map_while(Result::ok)
        .filter_map(|instruction| match instruction {
            Instruction::PushBytes(bytes) if !bytes.is_empty() => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
        .collect()
}

/// Pubkey hash of a P2PKH script.
pub fn extract_pubkey_hash(script: &Script) -> Option<Vec<u8>> {
    script.is_p2pkh().then(|| script.as_bytes()[3..23].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{PubkeyHash, ScriptBuf, Txid};

    #[test]
    fn test_outpoint_bytes_layout() {
        let outpoint = OutPoint {
            txid: Txid::from_byte_array([7; 32]),
            vout: 2,
        };
        let bytes = outpoint_to_bytes(&outpoint);
        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[..32], &[7; 32]);
        assert_eq!(&bytes[32..], &[2, 0, 0, 0]);
    }

    #[test]
    fn test_p2pkh_pushes() {
        let hash = PubkeyHash::from_byte_array([0xab; 20]);
        let script = ScriptBuf::new_p2pkh(&hash);
        assert_eq!(script_push_data(&script), vec![vec![0xab; 20]]);
        assert_eq!(extract_pubkey_hash(&script), Some(vec![0xab; 20]));
        assert_eq!(extract_pubkey_hash(&ScriptBuf::new()), None);
    }
}
