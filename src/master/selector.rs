//! Replica placement policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::cache::PartitionServer;

/// Chooses the target PS for a new replica from the alive server set.
pub trait Selector: Send + Sync {
    fn select_target(&self, servers: &[Arc<PartitionServer>]) -> Option<Arc<PartitionServer>>;
}

/// Idle-preferred round-robin: among the servers hosting the fewest
/// partitions, rotate.
#[derive(Default)]
pub struct IdleSelector {
    cursor: AtomicUsize,
}

impl IdleSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Selector for IdleSelector {
    fn select_target(&self, servers: &[Arc<PartitionServer>]) -> Option<Arc<PartitionServer>> {
        let min = servers.iter().map(|s| s.partition_count()).min()?;
        let idle: Vec<_> = servers
            .iter()
            .filter(|s| s.partition_count() == min)
            .collect();

        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        idle.get(cursor % idle.len()).map(|s| (*s).clone())
    }
}
