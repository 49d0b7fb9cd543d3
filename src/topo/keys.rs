//! Key encoding for the topology store.
//!
//! Every durable record lives under `"<prefix><decimal-id>"`, e.g.
//! `"schema partition 42"`. Prefix scans pass `[prefix, bytes_prefix(prefix))`
//! to the store's range iteration.

use crate::types::{DbId, NodeId, PartitionId, SpaceId};
use crate::constants::{PREFIX_DB, PREFIX_PARTITION, PREFIX_PS, PREFIX_SPACE};

/// Key of a persisted partition record.
pub fn partition_key(id: PartitionId) -> String {
    format!("{PREFIX_PARTITION}{id}")
}

/// Key of a persisted database record.
pub fn db_key(id: DbId) -> String {
    format!("{PREFIX_DB}{id}")
}

/// Key of a persisted space record.
pub fn space_key(id: SpaceId) -> String {
    format!("{PREFIX_SPACE}{id}")
}

/// Key of a persisted partition-server record.
pub fn ps_key(id: NodeId) -> String {
    format!("{PREFIX_PS}{id}")
}

/// Decode the decimal id suffix of a prefixed key.
pub fn decode_id(key: &str, prefix: &str) -> Option<u64> {
    key.strip_prefix(prefix)?.parse().ok()
}

/// Compute the exclusive upper bound of a prefix range.
///
/// Returns `None` when the prefix is all `0xff` bytes, in which case the scan
/// is unbounded above.
pub fn bytes_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    for i in (0..prefix.len()).rev() {
        if prefix[i] < 0xff {
            let mut limit = prefix[..=i].to_vec();
            limit[i] += 1;
            return Some(limit);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        assert_eq!(partition_key(PartitionId(42)), "schema partition 42");
        assert_eq!(db_key(DbId(1)), "schema db 1");
        assert_eq!(space_key(SpaceId(7)), "schema space 7");
        assert_eq!(ps_key(NodeId(3)), "schema ps 3");
    }

    #[test]
    fn decode_id_roundtrip() {
        let key = partition_key(PartitionId(42));
        assert_eq!(decode_id(&key, PREFIX_PARTITION), Some(42));
        assert_eq!(decode_id(&key, PREFIX_DB), None);
        assert_eq!(decode_id("schema partition x", PREFIX_PARTITION), None);
    }

    #[test]
    fn bytes_prefix_bumps_last_byte() {
        assert_eq!(bytes_prefix(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(bytes_prefix(b"a\xff"), Some(b"b".to_vec()));
        assert_eq!(bytes_prefix(b"\xff\xff"), None);
    }

    #[test]
    fn bytes_prefix_bounds_the_key_space() {
        let prefix = PREFIX_PARTITION.as_bytes();
        let limit = bytes_prefix(prefix).unwrap();
        let key = partition_key(PartitionId(123));
        assert!(key.as_bytes() >= prefix);
        assert!(key.as_bytes() < limit.as_slice());
    }
}
