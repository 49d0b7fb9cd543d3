//! Heartbeat-driven reconciliation.
//!
//! Each PS heartbeat carries the node's view of every partition it hosts.
//! This module diffs each report against the authoritative record and emits
//! processor events until the actual replica layout converges on the
//! intended one. Per-partition decisions are serialized by the record's
//! write lock and rate-limited by the 30-second task latch; errors are never
//! surfaced to the heartbeat response, the next beat re-drives convergence.
//!
//! Decision table, with `m` the record's conf version and `h` the reported
//! one:
//!
//! | condition | action |
//! |---|---|
//! | partition unknown | force-delete the reported replica at the reporter |
//! | `h < m` | latch, delete a reported replica via the known leader |
//! | `h > m`, leader reported | replace the whole replica group, then check cardinality |
//! | `h == m`, leader reported | validate the leader (illegal -> delete; unknown record leader -> group update), then check cardinality |
//! | no leader reported | no-op |

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::protocol::{pick_leader_replica, pick_replica_to_delete, PartitionInfo, PsHeartbeatRequest};

use super::cache::PartitionServer;
use super::cluster::ControlPlane;
use super::partition::Partition;
use super::processor::{PartitionProcessor, ProcessorEvent};

/// Reconcile every partition report of one heartbeat.
///
/// The caller has already leader-gated the request and resolved `ps`.
pub async fn process_heartbeat(
    cluster: &ControlPlane,
    processor: &PartitionProcessor,
    ps: &PartitionServer,
    req: &PsHeartbeatRequest,
) {
    for info in &req.partitions {
        reconcile_partition(cluster, processor, ps, info).await;
    }
}

async fn reconcile_partition(
    cluster: &ControlPlane,
    processor: &PartitionProcessor,
    ps: &PartitionServer,
    info: &PartitionInfo,
) {
    let Some(partition) = cluster.partition_cache.find_partition_by_id(info.id) else {
        info!(partition = %info.id, node = %ps.id(), "heartbeat reported a partition unknown to the cluster");
        if let Some(replica) = pick_replica_to_delete(info) {
            push(processor, ProcessorEvent::ForceDelete {
                partition_id: info.id,
                rpc_addr: ps.rpc_addr().to_string(),
                replica: replica.clone(),
            });
        }
        return;
    };

    let conf_ms = partition.epoch_conf_version().await;
    let conf_hb = info.epoch.conf_version;
    debug!(partition = %info.id, conf_hb, conf_ms, "reconciling heartbeat report");

    let mut check_replica_count = false;

    if conf_hb < conf_ms {
        // Stale group: tear the reported replicas down via the known leader.
        if !partition.take_change_member_task().await {
            return;
        }
        if let Some(replica) = pick_replica_to_delete(info) {
            push(processor, ProcessorEvent::Delete {
                partition_id: info.id,
                leader_node: partition.leader_node_id().await,
                replica: replica.clone(),
            });
        }
        return;
    } else if conf_hb > conf_ms {
        let Some(leader) = pick_leader_replica(info) else {
            // A follower-only report at a higher epoch defers to the
            // leader's own report.
            debug!(partition = %info.id, conf_hb, "higher epoch without leader report, waiting");
            return;
        };
        let leader = leader.clone();

        let (expired, ok) = partition
            .update_replica_group_by_cond(cluster.topo.as_ref(), info, &leader)
            .await;
        if expired || !ok {
            debug!(partition = %info.id, update_ok = ok, "replica group update rejected, waiting next heartbeat");
            return;
        }
        index_partition_on_hosts(cluster, &partition).await;
        check_replica_count = true;
    } else {
        let Some(leader) = pick_leader_replica(info) else {
            return;
        };
        let leader = leader.clone();

        let (expired, illegal, ok) = partition
            .validate_and_update_leader_by_cond(info, &leader)
            .await;
        if expired {
            debug!(partition = %info.id, "same-epoch report raced a concurrent update, waiting next heartbeat");
            return;
        }
        if illegal {
            // The reported leader is not one of the record's replicas.
            if !partition.take_change_member_task().await {
                return;
            }
            if let Some(replica) = pick_replica_to_delete(info) {
                info!(partition = %info.id, replica = %replica.id, "deleting replica of illegal group");
                push(processor, ProcessorEvent::Delete {
                    partition_id: info.id,
                    leader_node: leader.node_id,
                    replica: replica.clone(),
                });
            }
            return;
        }
        if !ok {
            // Same epoch but the record has no leader yet: adopt the whole
            // reported group.
            let (expired, ok) = partition
                .update_replica_group_by_cond(cluster.topo.as_ref(), info, &leader)
                .await;
            if expired || !ok {
                debug!(partition = %info.id, update_ok = ok, "replica group adoption rejected, waiting next heartbeat");
                return;
            }
            index_partition_on_hosts(cluster, &partition).await;
        }

        debug!(partition = %info.id, leader = %leader.id, "leader updated");
        check_replica_count = true;
    }

    if check_replica_count {
        check_cardinality(cluster, processor, &partition, info).await;
    }
}

/// Converge the replica set size on the configured target.
async fn check_cardinality(
    cluster: &ControlPlane,
    processor: &PartitionProcessor,
    partition: &Arc<Partition>,
    info: &PartitionInfo,
) {
    let count = partition.count_replicas().await;
    let target = cluster.config.replica_num;

    if count > target {
        // The reported set can exceed the target transiently, e.g. while a
        // snapshot transfer is in flight.
        warn!(partition = %partition.id(), count, target, "too many replicas, scheduling delete");
        if !partition.take_change_member_task().await {
            return;
        }
        if let Some(replica) = pick_replica_to_delete(info) {
            push(processor, ProcessorEvent::Delete {
                partition_id: partition.id(),
                leader_node: partition.leader_node_id().await,
                replica: replica.clone(),
            });
        }
    } else if count < target {
        info!(partition = %partition.id(), count, target, "too few replicas, scheduling create");
        if !partition.take_change_member_task().await {
            return;
        }
        push(processor, ProcessorEvent::Create(partition.clone()));
    } else {
        debug!(partition = %partition.id(), count, "replica count at target");
    }
}

/// Keep each hosting PS record's partition set current; it feeds
/// register-time recovery handoff and idle-preferred placement.
async fn index_partition_on_hosts(cluster: &ControlPlane, partition: &Arc<Partition>) {
    for replica in partition.meta().await.replicas {
        if let Some(ps) = cluster.ps_cache.find_server_by_id(replica.node_id) {
            ps.add_partition(partition.clone());
        }
    }
}

fn push(processor: &PartitionProcessor, event: ProcessorEvent) {
    // SYS_BUSY and shutdown are both recoverable: the next heartbeat
    // re-drives the decision.
    if let Err(e) = processor.push_event(event) {
        warn!(error = %e, "failed to enqueue processor event");
    }
}
