//! Hash slots and key ownership.
//!
//! Keys and node endpoints both map onto a 16384-slot ring via CRC16
//! (XMODEM parameters, the cluster hash deployed by redis-compatible
//! systems). A key's owner is the node whose endpoint slot is closest on
//! the ring, so every node with the same address view picks the same owner
//! without coordination.

use std::hash::{Hash, Hasher};

use super::errors::KeyOwnerError;

pub type HashSlot = u16;

/// Size of the slot table. Slots are `[0, MAX_HASH_SLOT)`.
pub const MAX_HASH_SLOT: HashSlot = 16384;

/// CRC16 with polynomial 0x1021, zero init, no reflection (XMODEM).
fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in bytes {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Reduce a key to the bytes that get hashed.
///
/// If the key contains `{...}` with non-empty content, only the bytes inside
/// the first such pair count. This pins related keys (`{user}.name`,
/// `{user}.email`) to one slot.
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&byte| byte == b'{') {
        let rest = &key[open + 1..];
        if let Some(close) = rest.iter().position(|&byte| byte == b'}') {
            if close > 0 {
                return &rest[..close];
            }
        }
    }
    key
}

/// Slot assignment for a key (or a `"host:port"` endpoint string).
pub fn slot(key: &str) -> HashSlot {
    crc16(hash_tag(key.as_bytes())) % MAX_HASH_SLOT
}

/// Shortest distance between two slots on the ring.
fn ring_distance(a: HashSlot, b: HashSlot) -> u16 {
    let direct = a.abs_diff(b);
    direct.min(MAX_HASH_SLOT - direct)
}

/// An inclusive slot interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub begin: HashSlot,
    pub end: HashSlot,
}

impl SlotRange {
    pub fn contains(&self, slot: HashSlot) -> bool {
        self.begin <= slot && slot <= self.end
    }

    pub fn overlaps(&self, other: &SlotRange) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }
}

/// A node's RPC endpoint together with its position on the slot ring.
///
/// Equality and hashing go by `host` and `port` only; the slot is derived
/// from them and carried for routing.
#[derive(Debug, Clone, Eq)]
pub struct NodeAddress {
    pub host: String,
    pub port: String,
    pub slot: HashSlot,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        let host = host.into();
        let port = port.into();
        let slot = slot(&format!("{host}:{port}"));
        Self { host, port, slot }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for NodeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Hash for NodeAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Pick the owner of `key` among `addresses`.
///
/// The owner minimizes ring distance to the key's slot; ties go to the
/// smaller endpoint slot, then to the lexicographically smaller
/// `"host:port"`, so every node agrees.
pub fn closest_address<'a>(
    addresses: &'a [NodeAddress],
    key: &str,
) -> Result<&'a NodeAddress, KeyOwnerError> {
    if key.is_empty() {
        return Err(KeyOwnerError::BlankKey);
    }

    let key_slot = slot(key);
    addresses
        .iter()
        .min_by(|a, b| {
            ring_distance(key_slot, a.slot)
                .cmp(&ring_distance(key_slot, b.slot))
                .then_with(|| a.slot.cmp(&b.slot))
                .then_with(|| a.address().cmp(&b.address()))
        })
        .ok_or(KeyOwnerError::MissingOwner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_vectors_are_stable() {
        // These must never change between runs or versions.
        assert_eq!(slot("test0"), 0x0281);
        assert_eq!(slot("test1"), 0x12a0);
        assert_eq!(slot("test2"), 0x22c3);
        assert_eq!(slot("test3"), 0x32e2);
        assert_eq!(slot("test4"), 0x0205);
        assert_eq!(slot("test5"), 0x1224);
        assert_eq!(slot("test6"), 0x2247);
        assert_eq!(slot("test7"), 0x3266);
        assert_eq!(slot("test8"), 0x0389);
        assert_eq!(slot("test9"), 0x13a8);
    }

    #[test]
    fn hash_tag_pins_related_keys() {
        assert_eq!(slot("{user}.name"), slot("{user}.email"));
        assert_eq!(slot("{user}.name"), slot("user"));
    }

    #[test]
    fn empty_hash_tag_falls_back_to_whole_key() {
        assert_eq!(slot("foo{}bar"), crc16(b"foo{}bar") % MAX_HASH_SLOT);
    }

    #[test]
    fn nested_braces_hash_first_closed_content() {
        // The first '}' closes the tag: "{{inner}}" hashes "{inner".
        assert_eq!(hash_tag(b"{{inner}}"), b"{inner");
    }

    #[test]
    fn unterminated_tag_falls_back_to_whole_key() {
        assert_eq!(hash_tag(b"foo{bar"), b"foo{bar");
    }

    #[test]
    fn range_contains_and_overlaps() {
        let low = SlotRange { begin: 0, end: 100 };
        let mid = SlotRange { begin: 50, end: 150 };
        let high = SlotRange {
            begin: 200,
            end: 300,
        };

        assert!(low.contains(0));
        assert!(low.contains(100));
        assert!(!low.contains(101));

        assert!(low.overlaps(&mid));
        assert!(mid.overlaps(&low));
        assert!(!low.overlaps(&high));
        assert!(!high.overlaps(&low));
    }

    #[test]
    fn ring_distance_wraps() {
        assert_eq!(ring_distance(0, 16383), 1);
        assert_eq!(ring_distance(0, 8192), 8192);
        assert_eq!(ring_distance(100, 100), 0);
    }

    #[test]
    fn owner_is_deterministic_regardless_of_order() {
        let mut addresses = vec![
            NodeAddress::new("localhost", "7000"),
            NodeAddress::new("localhost", "7001"),
            NodeAddress::new("localhost", "7002"),
        ];

        let owner = closest_address(&addresses, "test0").unwrap().clone();
        addresses.reverse();
        assert_eq!(*closest_address(&addresses, "test0").unwrap(), owner);
    }

    #[test]
    fn blank_key_has_no_owner() {
        let addresses = vec![NodeAddress::new("localhost", "7000")];
        assert_eq!(
            closest_address(&addresses, "").unwrap_err(),
            KeyOwnerError::BlankKey
        );
    }

    #[test]
    fn empty_address_table_has_no_owner() {
        assert_eq!(
            closest_address(&[], "key").unwrap_err(),
            KeyOwnerError::MissingOwner
        );
    }

    #[test]
    fn single_node_owns_everything() {
        let addresses = vec![NodeAddress::new("localhost", "7000")];
        for key in ["a", "b", "test0", "test9", "{tag}key"] {
            assert_eq!(*closest_address(&addresses, key).unwrap(), addresses[0]);
        }
    }

    #[test]
    fn address_equality_ignores_slot() {
        let a = NodeAddress::new("localhost", "7000");
        let mut b = a.clone();
        b.slot = 0;
        assert_eq!(a, b);
    }
}
