//! Slot -> partition interval index.
//!
//! Each space owns one tree, keyed by `start_slot`. A partition contains a
//! slot iff `start_slot <= slot < end_slot` (with the keyspace-final slot
//! owned by the partition whose end is `u32::MAX`). The tree holds no durable
//! state; it is rebuilt from the partition cache on recovery and serves the
//! routing RPC.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::types::SlotId;

use super::partition::Partition;

/// Interval index over the partitions of one space.
#[derive(Default)]
pub struct PartitionTree {
    /// start_slot -> partition. Interval ends are immutable, so entries can
    /// be compared without touching partition locks.
    tree: BTreeMap<u32, Arc<Partition>>,
}

impl PartitionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Insert a partition, first removing every partition whose interval
    /// overlaps it. Overlap is expected during splits; more than two removed
    /// entries is logged as suspicious.
    pub fn update(&mut self, partition: Arc<Partition>) {
        let start = partition.start_slot().value();
        let end = partition.end_slot().value();

        let overlaps: Vec<u32> = self
            .tree
            .range(..end)
            .filter(|(_, p)| p.end_slot().value() > start)
            .map(|(k, _)| *k)
            .collect();

        if overlaps.len() > 2 {
            warn!(
                partition = %partition.id(),
                count = overlaps.len(),
                "removing many overlapping partitions from tree"
            );
        }
        for key in overlaps {
            self.tree.remove(&key);
        }

        self.tree.insert(start, partition);
    }

    /// Remove a partition. Does nothing when the tree holds a different
    /// partition for the same interval.
    pub fn remove(&mut self, partition: &Partition) {
        let start = partition.start_slot().value();
        if let Some(found) = self.tree.get(&start) {
            if found.id() == partition.id() {
                self.tree.remove(&start);
            }
        }
    }

    /// The partition containing `slot`, if any.
    pub fn search(&self, slot: SlotId) -> Option<Arc<Partition>> {
        let (_, candidate) = self.tree.range(..=slot.value()).next_back()?;
        candidate.contains(slot).then(|| candidate.clone())
    }

    /// Up to `num` partitions starting at the one containing `slot`, walking
    /// ascending start order and stopping at the first gap (a partition whose
    /// start is not the previous end).
    pub fn multiple_search(&self, slot: SlotId, num: usize) -> Vec<Arc<Partition>> {
        let Some(first) = self.search(slot) else {
            return Vec::new();
        };

        let mut result = Vec::with_capacity(num);
        let mut expected_start = first.start_slot().value();
        for (_, partition) in self.tree.range(first.start_slot().value()..) {
            if result.len() == num {
                break;
            }
            if partition.start_slot().value() != expected_start {
                break;
            }
            expected_start = partition.end_slot().value();
            result.push(partition.clone());
        }
        result
    }
}
