//! Consensus-module seam.
//!
//! Replication is an external collaborator: the PS couples each partition to
//! a consensus group through [`ConsensusModule`] and never implements log
//! replication itself. The module owns the group's configuration epoch; the
//! contract is that it never hands back a `conf_version` lower than the one
//! it was given (epoch monotonicity is a wire contract with the master).
//!
//! [`RaftResolver`] is the address book the consensus transport resolves
//! peer `NodeId`s through; the lifecycle handler registers every replica's
//! addresses before starting a group.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::protocol::ReplicaChange;
use crate::types::{Epoch, NodeId, PartitionId, PartitionMeta, Replica, ReplicaAddrs};

/// The consumed consensus surface.
#[async_trait]
pub trait ConsensusModule: Send + Sync {
    /// Register a partition's replication group. Returns the group's
    /// configuration epoch, which is never below `partition.epoch`.
    async fn create_group(&self, partition: &PartitionMeta, node: NodeId) -> Result<Epoch>;

    /// Remove a partition's replication group.
    async fn remove_group(&self, partition_id: PartitionId) -> Result<()>;

    /// Apply a membership change. Only legal on the group's leader. Returns
    /// the epoch after the change.
    async fn change_member(
        &self,
        partition_id: PartitionId,
        change: ReplicaChange,
        replica: &Replica,
        current: Epoch,
    ) -> Result<Epoch>;

    /// Ask the group to transfer leadership to this node.
    async fn try_to_leader(&self, partition_id: PartitionId) -> Result<()>;

    /// Whether this node currently leads the group.
    fn is_leader(&self, partition_id: PartitionId) -> bool;
}

/// NodeId -> transport addresses, shared with the consensus transport.
#[derive(Default)]
pub struct RaftResolver {
    nodes: DashMap<NodeId, ReplicaAddrs>,
}

impl RaftResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: NodeId, addrs: ReplicaAddrs) {
        self.nodes.insert(node, addrs);
    }

    pub fn delete_node(&self, node: NodeId) {
        self.nodes.remove(&node);
    }

    pub fn resolve(&self, node: NodeId) -> Option<ReplicaAddrs> {
        self.nodes.get(&node).map(|a| a.value().clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(any(test, feature = "test-utilities"))]
pub use mock::MockConsensus;

#[cfg(any(test, feature = "test-utilities"))]
mod mock {
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;

    #[derive(Clone)]
    struct Group {
        epoch: Epoch,
        is_leader: bool,
    }

    /// In-memory [`ConsensusModule`] for tests.
    ///
    /// Creating a group bumps the configuration epoch (a freshly formed
    /// group has a new configuration) and makes this node its leader, which
    /// is what a single-replica deployment observes. Tests needing follower
    /// behavior flip leadership with [`set_leader`](MockConsensus::set_leader).
    #[derive(Default)]
    pub struct MockConsensus {
        groups: DashMap<PartitionId, Group>,
        changes: Mutex<Vec<(PartitionId, ReplicaChange, Replica)>>,
        leader_transfers: Mutex<Vec<PartitionId>>,
    }

    impl MockConsensus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_leader(&self, partition_id: PartitionId, is_leader: bool) {
            if let Some(mut group) = self.groups.get_mut(&partition_id) {
                group.is_leader = is_leader;
            }
        }

        pub fn has_group(&self, partition_id: PartitionId) -> bool {
            self.groups.contains_key(&partition_id)
        }

        /// Membership changes observed, in order.
        pub fn changes(&self) -> Vec<(PartitionId, ReplicaChange, Replica)> {
            self.changes.lock().expect("mock consensus poisoned").clone()
        }

        pub fn leader_transfers(&self) -> Vec<PartitionId> {
            self.leader_transfers
                .lock()
                .expect("mock consensus poisoned")
                .clone()
        }
    }

    #[async_trait]
    impl ConsensusModule for MockConsensus {
        async fn create_group(&self, partition: &PartitionMeta, _node: NodeId) -> Result<Epoch> {
            let epoch = Epoch::new(partition.epoch.conf_version + 1, partition.epoch.version);
            self.groups
                .insert(partition.id, Group { epoch, is_leader: true });
            Ok(epoch)
        }

        async fn remove_group(&self, partition_id: PartitionId) -> Result<()> {
            self.groups.remove(&partition_id);
            Ok(())
        }

        async fn change_member(
            &self,
            partition_id: PartitionId,
            change: ReplicaChange,
            replica: &Replica,
            current: Epoch,
        ) -> Result<Epoch> {
            let mut group = self
                .groups
                .get_mut(&partition_id)
                .ok_or(Error::PsNoPartition)?;
            if !group.is_leader {
                return Err(Error::PsNotLeader);
            }

            group.epoch = Epoch::new(
                group.epoch.conf_version.max(current.conf_version) + 1,
                group.epoch.version,
            );
            self.changes
                .lock()
                .expect("mock consensus poisoned")
                .push((partition_id, change, replica.clone()));
            Ok(group.epoch)
        }

        async fn try_to_leader(&self, partition_id: PartitionId) -> Result<()> {
            let mut group = self
                .groups
                .get_mut(&partition_id)
                .ok_or(Error::PsNoPartition)?;
            group.is_leader = true;
            self.leader_transfers
                .lock()
                .expect("mock consensus poisoned")
                .push(partition_id);
            Ok(())
        }

        fn is_leader(&self, partition_id: PartitionId) -> bool {
            self.groups
                .get(&partition_id)
                .map(|g| g.is_leader)
                .unwrap_or(false)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn meta(id: u64) -> PartitionMeta {
            PartitionMeta { id: PartitionId(id), ..Default::default() }
        }

        #[tokio::test]
        async fn create_group_bumps_epoch_and_leads() {
            let consensus = MockConsensus::new();
            let epoch = consensus.create_group(&meta(1), NodeId(1)).await.unwrap();
            assert_eq!(epoch.conf_version, 1);
            assert!(consensus.is_leader(PartitionId(1)));
            assert!(consensus.has_group(PartitionId(1)));
        }

        #[tokio::test]
        async fn change_member_requires_leadership() {
            let consensus = MockConsensus::new();
            consensus.create_group(&meta(1), NodeId(1)).await.unwrap();
            consensus.set_leader(PartitionId(1), false);

            let err = consensus
                .change_member(PartitionId(1), ReplicaChange::Add, &Replica::default(), Epoch::default())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::PsNotLeader));
        }

        #[tokio::test]
        async fn change_member_is_monotonic() {
            let consensus = MockConsensus::new();
            let e1 = consensus.create_group(&meta(1), NodeId(1)).await.unwrap();
            let e2 = consensus
                .change_member(PartitionId(1), ReplicaChange::Add, &Replica::default(), e1)
                .await
                .unwrap();
            assert!(e2.conf_version > e1.conf_version);
            assert_eq!(consensus.changes().len(), 1);
        }

        #[tokio::test]
        async fn missing_group_errors() {
            let consensus = MockConsensus::new();
            assert!(matches!(
                consensus.try_to_leader(PartitionId(9)).await,
                Err(Error::PsNoPartition)
            ));
            assert!(!consensus.is_leader(PartitionId(9)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_roundtrip() {
        let resolver = RaftResolver::new();
        assert!(resolver.is_empty());

        let addrs = ReplicaAddrs { rpc: "10.0.0.1:8813".into(), ..Default::default() };
        resolver.add_node(NodeId(1), addrs.clone());
        assert_eq!(resolver.resolve(NodeId(1)).unwrap().rpc, addrs.rpc);
        assert_eq!(resolver.len(), 1);

        resolver.delete_node(NodeId(1));
        assert!(resolver.resolve(NodeId(1)).is_none());
    }
}
