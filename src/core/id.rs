//! Node identifier types.

use std::{cmp::Ordering, fmt, hash::Hasher, str::FromStr};

use bincode::{Decode, Encode};
use fnv::FnvHasher;
use sha2::{Digest, Sha256};

use crate::error::NetworkError;

/// A 256-bit node identifier, the bytes of the node's ed25519 verifying key.
///
/// The all-zero identifier is reserved as the "invalid" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Encode, Decode)]
pub struct NodeId {
    bytes: [u8; Self::BYTES],
}

impl NodeId {
    /// The size of the identifier in bytes.
    pub const BYTES: usize = 32;

    /// The size of the identifier in bits.
    pub const BITS: usize = 32 * 8;

    /// Creates a new identifier from the supplied bytes.
    pub fn new(bytes: [u8; Self::BYTES]) -> Self {
        NodeId { bytes }
    }

    /// Returns the bytes backing the identifier.
    pub fn bytes(&self) -> [u8; Self::BYTES] {
        self.bytes
    }

    pub fn as_bytes(&self) -> &[u8; Self::BYTES] {
        &self.bytes
    }

    /// Returns `false` for the all-zero sentinel.
    pub fn is_valid(&self) -> bool {
        self.bytes.iter().any(|&b| b != 0)
    }

    /// Parses a hex identifier, with or without the `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, NetworkError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut bytes = [0u8; Self::BYTES];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| NetworkError::InvalidNodeId(s.into()))?;

        Ok(Self { bytes })
    }

    /// The `0x`-prefixed lowercase hex form, also used to order group members.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.bytes))
    }

    /// The SHA-256 of the identifier, which positions the node in the routing key space.
    pub fn sha(&self) -> KeyHash {
        KeyHash::of(&self.bytes)
    }

    /// The 64-bit network identifier keying the peer table and transport connections.
    pub fn net_id(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(&self.bytes);
        hasher.finish()
    }

    /// The 32-bit prefix used when generating flood message identifiers, the folded network id.
    pub fn forward_id(&self) -> u32 {
        let net_id = self.net_id();
        ((net_id >> 32) ^ net_id) as u32
    }

    #[cfg(test)]
    /// Convenience function for working with small identifiers during testing.
    pub fn from_u16(raw: u16) -> Self {
        let mut bytes = [0u8; Self::BYTES];
        bytes[Self::BYTES - 2..].copy_from_slice(&raw.to_be_bytes());

        Self { bytes }
    }

    /// A random identifier, used as a lookup target and in tests.
    pub fn rand() -> Self {
        use rand::{thread_rng, Rng};

        let mut bytes = [0u8; Self::BYTES];
        thread_rng().fill(&mut bytes);

        Self { bytes }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first four bytes are plenty to tell nodes apart in logs.
        write!(f, "NodeId(0x{}..)", hex::encode(&self.bytes[..4]))
    }
}

impl FromStr for NodeId {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// A point in the 256-bit routing key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHash([u8; 32]);

impl KeyHash {
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Computes the log2 of the XOR-based distance between two hashes, 1-indexed: the number of
    /// bits following the common prefix. Equal hashes are at distance 0.
    pub fn log_distance(&self, other: &KeyHash) -> u32 {
        // The hashes are big-endian: the first differing byte holds the most-significant bit of
        // the distance, its position in bits is counted from the end of the array.
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(&a, &b)| a ^ b)
            .enumerate()
            .find(|(_, byte)| byte != &0b0)
            .map(|(i, byte)| Self::msb(byte) + 1 + (((31 - i) as u32) << 3))
            .unwrap_or(0)
    }

    /// Compares `a` and `b` by their XOR distance to `self`, byte by byte.
    pub fn distance_cmp(&self, a: &KeyHash, b: &KeyHash) -> Ordering {
        for i in 0..self.0.len() {
            let da = a.0[i] ^ self.0[i];
            let db = b.0[i] ^ self.0[i];
            match da.cmp(&db) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }

        Ordering::Equal
    }

    // Returns the position of the most-significant bit set in a byte (0-indexed).
    fn msb(n: u8) -> u32 {
        debug_assert_ne!(n, 0);
        // Safety: can't be 0 - 1.
        u8::BITS - n.leading_zeros() - 1
    }
}

#[cfg(test)]
mod tests {
    use rand::{thread_rng, Rng};

    use super::*;

    #[test]
    fn log_distance() {
        const N: usize = 1000;

        let mut rng = thread_rng();

        for _ in 0..N {
            let a: u16 = rng.gen();
            let b: u16 = rng.gen();

            let mut hash_a = [0u8; 32];
            let mut hash_b = [0u8; 32];
            hash_a[30..].copy_from_slice(&a.to_be_bytes());
            hash_b[30..].copy_from_slice(&b.to_be_bytes());

            let xor = a ^ b;
            let expected = u16::BITS - xor.leading_zeros();

            assert_eq!(KeyHash(hash_a).log_distance(&KeyHash(hash_b)), expected)
        }
    }

    #[test]
    fn log_distance_extremes() {
        let zero = KeyHash([0u8; 32]);
        let mut top = [0u8; 32];
        top[0] = 0x80;

        assert_eq!(zero.log_distance(&zero), 0);
        assert_eq!(zero.log_distance(&KeyHash(top)), 256);
    }

    #[test]
    fn distance_cmp() {
        let target = KeyHash([0u8; 32]);
        let mut near = [0u8; 32];
        near[31] = 1;
        let mut far = [0u8; 32];
        far[0] = 1;

        assert_eq!(
            target.distance_cmp(&KeyHash(near), &KeyHash(far)),
            Ordering::Less
        );
        assert_eq!(
            target.distance_cmp(&KeyHash(far), &KeyHash(near)),
            Ordering::Greater
        );
        assert_eq!(
            target.distance_cmp(&KeyHash(near), &KeyHash(near)),
            Ordering::Equal
        );
    }

    #[test]
    fn validity() {
        assert!(!NodeId::default().is_valid());
        assert!(NodeId::from_u16(1).is_valid());
    }

    #[test]
    fn hex_round_trip() {
        let id = NodeId::rand();
        let hex = id.to_hex();

        assert!(hex.starts_with("0x"));
        assert_eq!(hex.len(), 2 + 64);
        assert_eq!(NodeId::from_hex(&hex).unwrap(), id);
        assert_eq!(hex.trim_start_matches("0x").parse::<NodeId>().unwrap(), id);
        assert!(NodeId::from_hex("0x1234").is_err());
    }

    #[test]
    fn net_and_forward_ids() {
        let mut bytes = [0u8; NodeId::BYTES];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let id = NodeId::new(bytes);

        // FNV-1a 64 of the key bytes.
        assert_eq!(id.net_id(), 0xe6cb594c1a148ac5);
        assert_eq!(id.forward_id(), 0xfcdfd389);
        assert_ne!(NodeId::rand().net_id(), id.net_id());
    }
}
