//! The authoritative partition record and its cache.
//!
//! Every mutation path follows copy-persist-swap: take the record's write
//! lock, clone the persisted meta, mutate the clone, persist it under
//! `"schema partition <id>"`, and only then replace the in-memory state.
//! Readers always observe a consistent snapshot; a failed persist leaves the
//! record untouched and the next heartbeat re-drives the change.
//!
//! The record also carries the in-memory reconciliation state: the resolved
//! leader, the last accepted heartbeat, and the 30-second single-flight task
//! latch guarding change-member RPCs.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::constants::{CHANGE_MEMBER_TASK_TIMEOUT, PREFIX_PARTITION};
use crate::error::{Error, Result};
use crate::protocol::PartitionInfo;
use crate::topo::keys::partition_key;
use crate::topo::{IdAllocator, TopoStore};
use crate::types::{
    DbId, NodeId, PartitionId, PartitionMeta, PartitionStatus, Replica, ReplicaId, SlotId, SpaceId,
};

#[derive(Debug, Default)]
struct PartitionState {
    meta: PartitionMeta,
    /// Resolved leader; always one of `meta.replicas` when set.
    leader: Option<Replica>,
    last_heartbeat: Option<SystemTime>,
    task_in_flight: bool,
    task_deadline: Option<Instant>,
}

/// A partition as owned by the master's cache.
///
/// Identity and the slot interval are immutable and readable without
/// locking; everything else lives behind the per-record lock.
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    db: DbId,
    space: SpaceId,
    start_slot: SlotId,
    end_slot: SlotId,
    state: RwLock<PartitionState>,
}

impl Partition {
    /// Provision a fresh partition: allocated ID, `Readonly`, no replicas.
    /// Replicas arrive later through heartbeat reconciliation.
    pub async fn create(
        ids: &IdAllocator,
        db: DbId,
        space: SpaceId,
        start_slot: SlotId,
        end_slot: SlotId,
    ) -> Result<Self> {
        let id = PartitionId(ids.next().await?);
        Ok(Self::from_meta(PartitionMeta {
            id,
            db,
            space,
            start_slot,
            end_slot,
            replicas: Vec::new(),
            status: PartitionStatus::Readonly,
            ..Default::default()
        }))
    }

    pub fn from_meta(meta: PartitionMeta) -> Self {
        Partition {
            id: meta.id,
            db: meta.db,
            space: meta.space,
            start_slot: meta.start_slot,
            end_slot: meta.end_slot,
            state: RwLock::new(PartitionState { meta, ..Default::default() }),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn db(&self) -> DbId {
        self.db
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn start_slot(&self) -> SlotId {
        self.start_slot
    }

    pub fn end_slot(&self) -> SlotId {
        self.end_slot
    }

    /// Whether `slot` falls in this partition's interval.
    pub fn contains(&self, slot: SlotId) -> bool {
        slot >= self.start_slot
            && (slot < self.end_slot || (self.end_slot == SlotId::MAX && slot == SlotId::MAX))
    }

    /// Snapshot of the persisted record.
    pub async fn meta(&self) -> PartitionMeta {
        self.state.read().await.meta.clone()
    }

    pub async fn epoch_conf_version(&self) -> u64 {
        self.state.read().await.meta.epoch.conf_version
    }

    pub async fn count_replicas(&self) -> usize {
        self.state.read().await.meta.replicas.len()
    }

    pub async fn find_replica(&self, id: ReplicaId) -> Option<Replica> {
        self.state.read().await.meta.find_replica(id).cloned()
    }

    pub async fn leader(&self) -> Option<Replica> {
        self.state.read().await.leader.clone()
    }

    /// Node hosting the current leader, or `NodeId::ZERO` when unknown.
    pub async fn leader_node_id(&self) -> NodeId {
        self.state
            .read()
            .await
            .leader
            .as_ref()
            .map(|r| r.node_id)
            .unwrap_or(NodeId::ZERO)
    }

    pub async fn last_heartbeat(&self) -> Option<SystemTime> {
        self.state.read().await.last_heartbeat
    }

    /// Persist the current record. Used at provisioning time, before the
    /// partition is published to any cache.
    pub async fn persist(&self, topo: &dyn TopoStore) -> Result<()> {
        let state = self.state.read().await;
        let value = encode_meta(&state.meta)?;
        topo.put(&partition_key(self.id), value).await?;
        Ok(())
    }

    /// Delete the persisted record.
    pub async fn erase(&self, topo: &dyn TopoStore) -> Result<()> {
        topo.delete(&partition_key(self.id))
            .await
            .map_err(|e| Error::LocalDbOps(e.to_string()))
    }

    /// Append replicas to the persisted set.
    pub async fn add_replica(&self, topo: &dyn TopoStore, replica: Replica) -> Result<()> {
        let mut state = self.state.write().await;

        let mut copy = state.meta.clone();
        copy.replicas.push(replica);

        let value = encode_meta(&copy)?;
        topo.put(&partition_key(self.id), value).await?;

        state.meta = copy;
        Ok(())
    }

    /// Remove replicas from the persisted set by ID.
    pub async fn delete_replica(&self, topo: &dyn TopoStore, ids: &[ReplicaId]) -> Result<()> {
        let mut state = self.state.write().await;

        let mut copy = state.meta.clone();
        copy.replicas.retain(|r| !ids.contains(&r.id));

        let value = encode_meta(&copy)?;
        topo.put(&partition_key(self.id), value).await?;

        state.meta = copy;
        Ok(())
    }

    /// Replace the whole replica group from a leader's heartbeat report.
    ///
    /// Returns `(ver_expired, update_ok)`. Rejected with `ver_expired` when
    /// the reported `conf_version` is behind the record, or equal while a
    /// leader is already known (idempotence: the same report applied twice is
    /// a no-op). On success the epoch, status, and replica set are persisted,
    /// the leader and heartbeat stamp are updated, and the task latch is
    /// cleared.
    pub async fn update_replica_group_by_cond(
        &self,
        topo: &dyn TopoStore,
        info: &PartitionInfo,
        leader_replica: &Replica,
    ) -> (bool, bool) {
        let mut state = self.state.write().await;

        if info.epoch.conf_version < state.meta.epoch.conf_version
            || (info.epoch.conf_version == state.meta.epoch.conf_version
                && state.leader.is_some())
        {
            return (true, false);
        }

        let Some(raft_status) = info.raft_status.as_ref() else {
            return (false, false);
        };

        let mut copy = state.meta.clone();
        copy.epoch = info.epoch;
        copy.status = info.status;
        copy.replicas = Vec::with_capacity(raft_status.followers.len() + 1);
        copy.replicas.push(raft_status.replica.clone());
        for follower in &raft_status.followers {
            copy.replicas.push(follower.replica.clone());
        }

        let value = match encode_meta(&copy) {
            Ok(value) => value,
            Err(_) => return (false, false),
        };
        if let Err(e) = topo.put(&partition_key(self.id), value).await {
            error!(partition = %self.id, error = %e, "failed to persist replica group update");
            return (false, false);
        }

        state.meta = copy;
        state.task_in_flight = false;
        state.task_deadline = None;
        state.last_heartbeat = Some(SystemTime::now());
        state.leader = Some(leader_replica.clone());

        (false, true)
    }

    /// Validate a same-epoch leader report and update the resolved leader.
    ///
    /// Returns `(ver_expired, illegal, update_ok)`:
    /// - `ver_expired` iff the reported `conf_version` differs from the
    ///   record;
    /// - `illegal` iff the reported leader is not one of the record's
    ///   replicas;
    /// - `update_ok` iff neither held and a leader was already known (when no
    ///   leader is known the caller falls through to the group update).
    pub async fn validate_and_update_leader_by_cond(
        &self,
        info: &PartitionInfo,
        leader_replica: &Replica,
    ) -> (bool, bool, bool) {
        let mut state = self.state.write().await;

        if info.epoch.conf_version != state.meta.epoch.conf_version {
            return (true, false, false);
        }

        if state.leader.is_none() {
            return (false, false, false);
        }

        if state.meta.find_replica(leader_replica.id).is_none() {
            return (false, true, false);
        }

        state.last_heartbeat = Some(SystemTime::now());
        state.leader = Some(leader_replica.clone());

        (false, false, true)
    }

    /// Try to acquire the single-flight change-member latch.
    ///
    /// Returns `true` iff no task is in flight or the previous task's window
    /// has elapsed; on `true` the latch is re-armed. A successful
    /// [`update_replica_group_by_cond`](Self::update_replica_group_by_cond)
    /// clears it early.
    pub async fn take_change_member_task(&self) -> bool {
        let mut state = self.state.write().await;

        let expired = state
            .task_deadline
            .map(|d| d.elapsed() >= CHANGE_MEMBER_TASK_TIMEOUT)
            .unwrap_or(true);

        if !state.task_in_flight || expired {
            state.task_in_flight = true;
            state.task_deadline = Some(Instant::now());
            return true;
        }

        false
    }
}

fn encode_meta(meta: &PartitionMeta) -> Result<Bytes> {
    serde_json::to_vec(meta)
        .map(Bytes::from)
        .map_err(|e| {
            error!(partition = %meta.id, error = %e, "failed to encode partition");
            Error::Internal(format!("encode partition: {e}"))
        })
}

fn decode_meta(value: &[u8]) -> Result<PartitionMeta> {
    serde_json::from_slice(value).map_err(|e| {
        error!(error = %e, "failed to decode partition from topology store");
        Error::Internal(format!("decode partition: {e}"))
    })
}

/// Master-side index of every partition in the zone.
#[derive(Default)]
pub struct PartitionCache {
    partitions: DashMap<PartitionId, Arc<Partition>>,
}

impl PartitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_partition_by_id(&self, id: PartitionId) -> Option<Arc<Partition>> {
        self.partitions.get(&id).map(|p| p.value().clone())
    }

    pub fn add_partition(&self, partition: Arc<Partition>) {
        self.partitions.insert(partition.id(), partition);
    }

    pub fn remove_partition(&self, id: PartitionId) -> Option<Arc<Partition>> {
        self.partitions.remove(&id).map(|(_, p)| p)
    }

    pub fn all_partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn clear(&self) {
        self.partitions.clear();
    }

    /// Load every persisted partition. Returns the decoded records without
    /// touching the cache; the caller inserts them and rebuilds the space
    /// trees, so re-running yields the same state.
    pub async fn recover(topo: &dyn TopoStore) -> Result<Vec<Arc<Partition>>> {
        let entries = topo.scan(PREFIX_PARTITION).await?;
        let mut result = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let meta = decode_meta(&value)?;
            debug!(key, partition = %meta.id, "recovered partition");
            result.push(Arc::new(Partition::from_meta(meta)));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FollowerStatus, RaftStatus};
    use crate::topo::mem::MemTopoStore;
    use crate::types::Epoch;

    fn replica(id: u64, node: u64) -> Replica {
        Replica { id: ReplicaId(id), node_id: NodeId(node), ..Default::default() }
    }

    fn leader_report(
        id: PartitionId,
        conf_version: u64,
        leader: Replica,
        followers: Vec<Replica>,
    ) -> PartitionInfo {
        PartitionInfo {
            id,
            epoch: Epoch::new(conf_version, 0),
            status: PartitionStatus::Readwrite,
            is_leader: true,
            raft_status: Some(RaftStatus {
                replica: leader,
                followers: followers
                    .into_iter()
                    .map(|r| FollowerStatus { replica: r })
                    .collect(),
            }),
        }
    }

    fn test_partition(id: u64) -> Partition {
        Partition::from_meta(PartitionMeta {
            id: PartitionId(id),
            start_slot: SlotId(0),
            end_slot: SlotId(100),
            status: PartitionStatus::Readonly,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn update_group_applies_newer_epoch() {
        let topo = MemTopoStore::new();
        let partition = test_partition(1);
        let leader = replica(5, 1);
        let info = leader_report(PartitionId(1), 1, leader.clone(), vec![]);

        let (expired, ok) = partition
            .update_replica_group_by_cond(&topo, &info, &leader)
            .await;
        assert!(!expired);
        assert!(ok);

        let meta = partition.meta().await;
        assert_eq!(meta.epoch.conf_version, 1);
        assert_eq!(meta.replicas.len(), 1);
        assert_eq!(meta.status, PartitionStatus::Readwrite);
        assert_eq!(partition.leader().await.unwrap().id, ReplicaId(5));
        assert!(partition.last_heartbeat().await.is_some());

        // The update was persisted before the swap.
        let (value, _) = topo.get(&partition_key(PartitionId(1))).await.unwrap();
        let persisted = decode_meta(&value).unwrap();
        assert_eq!(persisted, meta);
    }

    #[tokio::test]
    async fn update_group_rejects_stale_epoch() {
        let topo = MemTopoStore::new();
        let partition = test_partition(1);
        let leader = replica(5, 1);

        let info = leader_report(PartitionId(1), 3, leader.clone(), vec![]);
        partition
            .update_replica_group_by_cond(&topo, &info, &leader)
            .await;

        let stale = leader_report(PartitionId(1), 2, leader.clone(), vec![]);
        let (expired, ok) = partition
            .update_replica_group_by_cond(&topo, &stale, &leader)
            .await;
        assert!(expired);
        assert!(!ok);
        assert_eq!(partition.epoch_conf_version().await, 3);
    }

    #[tokio::test]
    async fn update_group_same_epoch_with_leader_is_idempotent_reject() {
        let topo = MemTopoStore::new();
        let partition = test_partition(1);
        let leader = replica(5, 1);
        let info = leader_report(PartitionId(1), 1, leader.clone(), vec![]);

        partition
            .update_replica_group_by_cond(&topo, &info, &leader)
            .await;
        let (expired, ok) = partition
            .update_replica_group_by_cond(&topo, &info, &leader)
            .await;
        assert!(expired);
        assert!(!ok);
    }

    #[tokio::test]
    async fn update_group_clears_task_latch() {
        let topo = MemTopoStore::new();
        let partition = test_partition(1);
        assert!(partition.take_change_member_task().await);
        assert!(!partition.take_change_member_task().await);

        let leader = replica(5, 1);
        let info = leader_report(PartitionId(1), 1, leader.clone(), vec![]);
        partition
            .update_replica_group_by_cond(&topo, &info, &leader)
            .await;

        // Cleared latch can be taken again at once.
        assert!(partition.take_change_member_task().await);
    }

    #[tokio::test]
    async fn validate_leader_same_epoch() {
        let topo = MemTopoStore::new();
        let partition = test_partition(1);
        let r1 = replica(1, 1);
        let r2 = replica(2, 2);
        let info = leader_report(PartitionId(1), 4, r1.clone(), vec![r2.clone()]);
        partition
            .update_replica_group_by_cond(&topo, &info, &r1)
            .await;

        // Handover to another in-group replica is accepted.
        let handover = leader_report(PartitionId(1), 4, r2.clone(), vec![r1.clone()]);
        let (expired, illegal, ok) = partition
            .validate_and_update_leader_by_cond(&handover, &r2)
            .await;
        assert!(!expired && !illegal && ok);
        assert_eq!(partition.leader().await.unwrap().id, ReplicaId(2));
    }

    #[tokio::test]
    async fn validate_leader_rejects_unknown_replica() {
        let topo = MemTopoStore::new();
        let partition = test_partition(1);
        let r1 = replica(1, 1);
        let info = leader_report(PartitionId(1), 4, r1.clone(), vec![]);
        partition
            .update_replica_group_by_cond(&topo, &info, &r1)
            .await;

        let r9 = replica(9, 9);
        let bogus = leader_report(PartitionId(1), 4, r9.clone(), vec![]);
        let (expired, illegal, ok) = partition
            .validate_and_update_leader_by_cond(&bogus, &r9)
            .await;
        assert!(!expired);
        assert!(illegal);
        assert!(!ok);
        // Record unchanged.
        assert_eq!(partition.leader().await.unwrap().id, ReplicaId(1));
    }

    #[tokio::test]
    async fn validate_leader_epoch_mismatch() {
        let partition = test_partition(1);
        let r1 = replica(1, 1);
        let info = leader_report(PartitionId(1), 2, r1.clone(), vec![]);
        let (expired, illegal, ok) =
            partition.validate_and_update_leader_by_cond(&info, &r1).await;
        assert!(expired && !illegal && !ok);
    }

    #[tokio::test]
    async fn validate_leader_without_known_leader_falls_through() {
        let partition = test_partition(1);
        let r1 = replica(1, 1);
        let info = leader_report(PartitionId(1), 0, r1.clone(), vec![]);
        let (expired, illegal, ok) =
            partition.validate_and_update_leader_by_cond(&info, &r1).await;
        assert!(!expired && !illegal && !ok);
    }

    #[tokio::test]
    async fn add_and_delete_replica_persist() {
        let topo = MemTopoStore::new();
        let partition = test_partition(1);

        partition.add_replica(&topo, replica(1, 1)).await.unwrap();
        partition.add_replica(&topo, replica(2, 2)).await.unwrap();
        assert_eq!(partition.count_replicas().await, 2);

        partition
            .delete_replica(&topo, &[ReplicaId(1)])
            .await
            .unwrap();
        assert_eq!(partition.count_replicas().await, 1);
        assert!(partition.find_replica(ReplicaId(1)).await.is_none());
        assert!(partition.find_replica(ReplicaId(2)).await.is_some());

        let (value, _) = topo.get(&partition_key(PartitionId(1))).await.unwrap();
        let persisted = decode_meta(&value).unwrap();
        assert_eq!(persisted.replicas.len(), 1);
    }

    #[tokio::test]
    async fn cache_recover_roundtrip() {
        let topo = MemTopoStore::new();
        let partition = test_partition(7);
        partition.add_replica(&topo, replica(1, 1)).await.unwrap();
        let original = partition.meta().await;

        let recovered = PartitionCache::recover(&topo).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].meta().await, original);

        // Recovery is idempotent.
        let again = PartitionCache::recover(&topo).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].meta().await, original);
    }

    #[tokio::test]
    async fn erase_removes_record() {
        let topo = MemTopoStore::new();
        let partition = test_partition(7);
        partition.persist(&topo).await.unwrap();
        partition.erase(&topo).await.unwrap();
        assert!(PartitionCache::recover(&topo).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latch_is_single_flight() {
        let partition = test_partition(1);
        assert!(partition.take_change_member_task().await);
        assert!(!partition.take_change_member_task().await);
    }
}
