//! Partition store: the control-plane binding between a hosted partition
//! and its consensus group.
//!
//! The document engine behind the partition (index + KV) is an external
//! collaborator; this type tracks the partition meta, registers the replica
//! set with the consensus transport, and produces the per-partition
//! heartbeat report.

use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::Result;
use crate::protocol::{FollowerStatus, PartitionInfo, RaftStatus, ReplicaChange};
use crate::types::{NodeId, PartitionId, PartitionMeta, PartitionStatus, Replica};

use super::consensus::{ConsensusModule, RaftResolver};

/// One hosted partition.
pub struct PartitionStore {
    node_id: NodeId,
    meta: RwLock<PartitionMeta>,
    consensus: Arc<dyn ConsensusModule>,
    resolver: Arc<RaftResolver>,
}

impl PartitionStore {
    pub fn new(
        meta: PartitionMeta,
        node_id: NodeId,
        consensus: Arc<dyn ConsensusModule>,
        resolver: Arc<RaftResolver>,
    ) -> Self {
        PartitionStore { node_id, meta: RwLock::new(meta), consensus, resolver }
    }

    pub fn id(&self) -> PartitionId {
        self.meta.read().expect("store meta poisoned").id
    }

    pub fn meta(&self) -> PartitionMeta {
        self.meta.read().expect("store meta poisoned").clone()
    }

    pub fn status(&self) -> PartitionStatus {
        self.meta.read().expect("store meta poisoned").status
    }

    pub fn is_leader(&self) -> bool {
        self.consensus.is_leader(self.id())
    }

    /// Register peers with the transport and couple the partition to its
    /// consensus group. The group's configuration epoch (never below the
    /// meta's) becomes the reported epoch, and the store starts serving.
    pub async fn start(&self) -> Result<()> {
        let mut snapshot = self.meta();
        for replica in &snapshot.replicas {
            self.resolver.add_node(replica.node_id, replica.addrs.clone());
        }

        let epoch = self.consensus.create_group(&snapshot, self.node_id).await?;
        snapshot.epoch = epoch;
        snapshot.status = PartitionStatus::Readwrite;

        let mut meta = self.meta.write().expect("store meta poisoned");
        *meta = snapshot;
        debug!(partition = %meta.id, epoch = %meta.epoch, "partition store started");
        Ok(())
    }

    /// Decouple from the consensus group and mark the store unusable.
    pub async fn close(&self) {
        let id = self.id();
        let _ = self.consensus.remove_group(id).await;
        self.meta.write().expect("store meta poisoned").status = PartitionStatus::Invalid;
        debug!(partition = %id, "partition store closed");
    }

    /// Apply a leader-side membership change and reflect the new epoch and
    /// replica set in the meta. `conf_version` never decreases.
    pub async fn change_member(&self, change: ReplicaChange, replica: Replica) -> Result<()> {
        let current = self.meta().epoch;
        let epoch = self
            .consensus
            .change_member(self.id(), change, &replica, current)
            .await?;

        let mut meta = self.meta.write().expect("store meta poisoned");
        meta.epoch = epoch;
        match change {
            ReplicaChange::Add => {
                if meta.find_replica(replica.id).is_none() {
                    self.resolver.add_node(replica.node_id, replica.addrs.clone());
                    meta.replicas.push(replica);
                }
            }
            ReplicaChange::Remove => {
                meta.replicas.retain(|r| r.id != replica.id);
            }
        }
        Ok(())
    }

    /// Ask the consensus group to move leadership here.
    pub async fn try_to_leader(&self) -> Result<()> {
        self.consensus.try_to_leader(self.id()).await
    }

    /// The per-partition heartbeat payload.
    ///
    /// Follower reports carry no follower list; only the leader speaks for
    /// the group.
    pub fn partition_info(&self) -> PartitionInfo {
        let meta = self.meta.read().expect("store meta poisoned");
        let is_leader = self.consensus.is_leader(meta.id);

        let raft_status = meta.replica_on(self.node_id).map(|own| RaftStatus {
            replica: own.clone(),
            followers: if is_leader {
                meta.replicas
                    .iter()
                    .filter(|r| r.id != own.id)
                    .map(|r| FollowerStatus { replica: r.clone() })
                    .collect()
            } else {
                Vec::new()
            },
        });

        PartitionInfo {
            id: meta.id,
            epoch: meta.epoch,
            status: meta.status,
            is_leader,
            raft_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ps::consensus::MockConsensus;
    use crate::types::{Epoch, ReplicaAddrs, ReplicaId};

    fn replica(id: u64, node: u64) -> Replica {
        Replica {
            id: ReplicaId(id),
            node_id: NodeId(node),
            addrs: ReplicaAddrs { rpc: format!("10.0.0.{node}:8813"), ..Default::default() },
        }
    }

    fn store_with(replicas: Vec<Replica>) -> (PartitionStore, Arc<MockConsensus>) {
        let consensus = Arc::new(MockConsensus::new());
        let store = PartitionStore::new(
            PartitionMeta {
                id: PartitionId(10),
                epoch: Epoch::new(0, 0),
                replicas,
                status: PartitionStatus::Readonly,
                ..Default::default()
            },
            NodeId(1),
            consensus.clone(),
            Arc::new(RaftResolver::new()),
        );
        (store, consensus)
    }

    #[tokio::test]
    async fn start_couples_group_and_bumps_epoch() {
        let (store, consensus) = store_with(vec![replica(5, 1)]);
        store.start().await.unwrap();

        assert!(consensus.has_group(PartitionId(10)));
        assert_eq!(store.meta().epoch.conf_version, 1);
        assert_eq!(store.status(), PartitionStatus::Readwrite);
        assert!(store.is_leader());
        assert_eq!(store.resolver.resolve(NodeId(1)).unwrap().rpc, "10.0.0.1:8813");
    }

    #[tokio::test]
    async fn close_marks_invalid() {
        let (store, consensus) = store_with(vec![replica(5, 1)]);
        store.start().await.unwrap();
        store.close().await;

        assert!(!consensus.has_group(PartitionId(10)));
        assert_eq!(store.status(), PartitionStatus::Invalid);
    }

    #[tokio::test]
    async fn leader_report_lists_followers() {
        let (store, _) = store_with(vec![replica(5, 1), replica(6, 2)]);
        store.start().await.unwrap();

        let info = store.partition_info();
        assert!(info.is_leader);
        let raft_status = info.raft_status.unwrap();
        assert_eq!(raft_status.replica.id, ReplicaId(5));
        assert_eq!(raft_status.followers.len(), 1);
        assert_eq!(raft_status.followers[0].replica.id, ReplicaId(6));
    }

    #[tokio::test]
    async fn follower_report_has_no_followers() {
        let (store, consensus) = store_with(vec![replica(5, 1), replica(6, 2)]);
        store.start().await.unwrap();
        consensus.set_leader(PartitionId(10), false);

        let info = store.partition_info();
        assert!(!info.is_leader);
        assert!(info.raft_status.unwrap().followers.is_empty());
    }

    #[tokio::test]
    async fn change_member_updates_meta_monotonically() {
        let (store, _) = store_with(vec![replica(5, 1)]);
        store.start().await.unwrap();
        let before = store.meta().epoch.conf_version;

        store
            .change_member(ReplicaChange::Add, replica(6, 2))
            .await
            .unwrap();
        let meta = store.meta();
        assert!(meta.epoch.conf_version > before);
        assert_eq!(meta.replicas.len(), 2);

        store
            .change_member(ReplicaChange::Remove, replica(6, 2))
            .await
            .unwrap();
        let after = store.meta();
        assert_eq!(after.replicas.len(), 1);
        assert!(after.epoch.conf_version > meta.epoch.conf_version);
    }

    #[tokio::test]
    async fn report_without_own_replica_has_no_raft_status() {
        let (store, _) = store_with(vec![replica(6, 2)]);
        store.start().await.unwrap();
        assert!(store.partition_info().raft_status.is_none());
    }
}
