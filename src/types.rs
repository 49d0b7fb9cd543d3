//! Type-safe wrappers for cluster metadata primitives.
//!
//! These newtypes prevent mixing up identifiers that share an underlying
//! representation but have different semantic meanings, and carry the
//! persisted record types shared between the zone master and the partition
//! servers.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// The zero value, used to mean "unassigned".
            pub const ZERO: Self = $name(0);

            /// Create a new identifier from a raw value.
            #[inline]
            pub const fn new(value: u64) -> Self {
                $name(value)
            }

            /// Get the raw u64 value.
            #[inline]
            pub const fn value(self) -> u64 {
                self.0
            }

            /// Check whether the identifier has been assigned.
            #[inline]
            pub const fn is_assigned(self) -> bool {
                self.0 != 0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                $name(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type! {
    /// A partition-server node identifier, allocated by the zone master on
    /// first registration. `0` means "never registered".
    NodeId
}

id_type! {
    /// A database identifier.
    DbId
}

id_type! {
    /// A space identifier, unique within its database's zone.
    SpaceId
}

id_type! {
    /// A partition identifier.
    PartitionId
}

id_type! {
    /// A replica identifier, unique within its partition.
    ReplicaId
}

/// A slot keyspace coordinate.
///
/// A space's partitions cover `[0, 2^32)` via non-overlapping half-open
/// `[start_slot, end_slot)` intervals; a document's slot is derived from its
/// key hash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl SlotId {
    /// First slot of the keyspace.
    pub const MIN: Self = SlotId(0);

    /// Last representable slot. `2^32` is not representable as an exclusive
    /// bound, so a partition with `end_slot == MAX` also owns the final slot
    /// (see [`PartitionMeta::contains`]).
    pub const MAX: Self = SlotId(u32::MAX);

    #[inline]
    pub const fn new(value: u32) -> Self {
        SlotId(value)
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for SlotId {
    fn from(value: u32) -> Self {
        SlotId(value)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Split `[start, end]` into `n` boundary slots, inclusive of both ends.
///
/// Used when provisioning a space: `n` partitions need `n + 1` boundaries, of
/// which this returns the lower `n` plus the maximum (the caller pairs
/// adjacent boundaries into half-open intervals). Returns `None` when the
/// range cannot host `n` distinct boundaries.
pub fn slot_split(start: u32, end: u32, n: u64) -> Option<Vec<u32>> {
    if n == 0 {
        return None;
    }
    let (min, max) = if start <= end { (start, end) } else { (end, start) };
    if u64::from(max - min) + 1 < n {
        return None;
    }

    let mut ret = Vec::with_capacity(n as usize);
    match n {
        1 => ret.push(min),
        2 => {
            ret.push(min);
            ret.push(max);
        }
        _ => {
            let step = (max - min) / (n as u32 - 1);
            ret.push(min);
            for i in 1..n - 1 {
                ret.push(min + (i as u32) * step);
            }
            ret.push(max);
        }
    }
    Some(ret)
}

/// Partition lifecycle tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    /// Not usable; a PS treats a live store in this state as replaceable.
    #[default]
    Invalid,
    /// Created but not yet serving writes.
    Readonly,
    /// Fully serving.
    Readwrite,
}

/// Partition-server registration status as seen by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PsStatus {
    /// Known but not currently heartbeating.
    #[default]
    Offline,
    /// Registered and heartbeating.
    Registered,
}

/// Configuration/data epoch of a partition.
///
/// `conf_version` increments on replica-set changes, `version` on data or
/// schema bumps. Both are monotonic within a partition; the reconciler
/// rejects regressions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Epoch {
    pub conf_version: u64,
    pub version: u64,
}

impl Epoch {
    pub const fn new(conf_version: u64, version: u64) -> Self {
        Epoch { conf_version, version }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.conf_version, self.version)
    }
}

/// Addresses of the planes a replica's host node listens on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaAddrs {
    pub heartbeat: String,
    pub replicate: String,
    pub rpc: String,
    pub admin: String,
}

/// A single copy of a partition on a specific partition server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Replica {
    pub id: ReplicaId,
    pub node_id: NodeId,
    pub addrs: ReplicaAddrs,
}

/// The authoritative, persisted partition record.
///
/// Identity (`id`, `db`, `space`) and the slot interval are immutable after
/// creation; the replica set, epoch, and status evolve through the
/// copy-persist-swap writers in [`crate::master::partition`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub id: PartitionId,
    pub db: DbId,
    pub space: SpaceId,
    pub start_slot: SlotId,
    pub end_slot: SlotId,
    pub replicas: Vec<Replica>,
    pub epoch: Epoch,
    pub status: PartitionStatus,
}

impl PartitionMeta {
    /// Whether `slot` falls in this partition's half-open interval.
    ///
    /// A partition whose end is [`SlotId::MAX`] also owns the final slot,
    /// since `2^32` is not representable as an exclusive bound.
    #[inline]
    pub fn contains(&self, slot: SlotId) -> bool {
        slot >= self.start_slot
            && (slot < self.end_slot || (self.end_slot == SlotId::MAX && slot == SlotId::MAX))
    }

    /// Find a replica by its ID.
    pub fn find_replica(&self, id: ReplicaId) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.id == id)
    }

    /// Find the replica hosted on `node`, if any.
    pub fn replica_on(&self, node: NodeId) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.node_id == node)
    }
}

/// Persisted database record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DbMeta {
    pub id: DbId,
    pub name: String,
}

/// Persisted space record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpaceMeta {
    pub id: SpaceId,
    pub db: DbId,
    pub name: String,
    /// Number of partitions the space was provisioned with.
    pub partition_num: u32,
}

/// Persisted partition-server node record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeMeta {
    pub id: NodeId,
    pub ip: String,
    pub addrs: ReplicaAddrs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_newtype_roundtrip() {
        let id = PartitionId::new(42);
        assert_eq!(id.value(), 42);
        assert_eq!(u64::from(id), 42);
        assert_eq!(PartitionId::from(42u64), id);
        assert!(id.is_assigned());
        assert!(!NodeId::ZERO.is_assigned());
    }

    #[test]
    fn id_display() {
        assert_eq!(format!("{}", ReplicaId::new(7)), "7");
        assert_eq!(format!("{}", SlotId::new(123)), "123");
    }

    #[test]
    fn epoch_ordering_is_conf_version_major() {
        assert!(Epoch::new(2, 0) > Epoch::new(1, 9));
        assert!(Epoch::new(1, 3) > Epoch::new(1, 2));
        assert_eq!(format!("{}", Epoch::new(4, 2)), "4.2");
    }

    #[test]
    fn partition_contains_is_half_open() {
        let p = PartitionMeta {
            start_slot: SlotId(100),
            end_slot: SlotId(200),
            ..Default::default()
        };
        assert!(!p.contains(SlotId(99)));
        assert!(p.contains(SlotId(100)));
        assert!(p.contains(SlotId(199)));
        assert!(!p.contains(SlotId(200)));
    }

    #[test]
    fn full_space_partition_owns_final_slot() {
        let p = PartitionMeta {
            start_slot: SlotId::MIN,
            end_slot: SlotId::MAX,
            ..Default::default()
        };
        assert!(p.contains(SlotId(0)));
        assert!(p.contains(SlotId(u32::MAX)));
    }

    #[test]
    fn find_replica_by_id_and_node() {
        let p = PartitionMeta {
            replicas: vec![
                Replica { id: ReplicaId(1), node_id: NodeId(10), ..Default::default() },
                Replica { id: ReplicaId(2), node_id: NodeId(20), ..Default::default() },
            ],
            ..Default::default()
        };
        assert_eq!(p.find_replica(ReplicaId(2)).unwrap().node_id, NodeId(20));
        assert!(p.find_replica(ReplicaId(3)).is_none());
        assert_eq!(p.replica_on(NodeId(10)).unwrap().id, ReplicaId(1));
    }

    #[test]
    fn slot_split_counts() {
        assert_eq!(slot_split(0, u32::MAX, 1).unwrap(), vec![0]);
        assert_eq!(slot_split(0, 100, 2).unwrap(), vec![0, 100]);

        let bounds = slot_split(0, 90, 4).unwrap();
        assert_eq!(bounds.len(), 4);
        assert_eq!(bounds[0], 0);
        assert_eq!(*bounds.last().unwrap(), 90);
        assert!(bounds.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn slot_split_rejects_impossible() {
        assert!(slot_split(0, 1, 0).is_none());
        assert!(slot_split(0, 1, 3).is_none());
    }

    #[test]
    fn meta_serde_roundtrip() {
        let p = PartitionMeta {
            id: PartitionId(9),
            db: DbId(1),
            space: SpaceId(2),
            start_slot: SlotId(0),
            end_slot: SlotId(4096),
            replicas: vec![Replica {
                id: ReplicaId(5),
                node_id: NodeId(3),
                addrs: ReplicaAddrs {
                    heartbeat: "10.0.0.1:8100".into(),
                    replicate: "10.0.0.1:8200".into(),
                    rpc: "10.0.0.1:8300".into(),
                    admin: "10.0.0.1:8400".into(),
                },
            }],
            epoch: Epoch::new(3, 1),
            status: PartitionStatus::Readwrite,
        };
        let encoded = serde_json::to_vec(&p).unwrap();
        let decoded: PartitionMeta = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(p, decoded);
    }
}
