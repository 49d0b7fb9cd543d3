//! Asynchronous partition processor.
//!
//! The reconciler never talks to partition servers directly; it emits events
//! onto a bounded channel and a single long-lived worker executes the RPC
//! sequences, each event in its own task. The channel exists solely for
//! ordering at the ingress: producers observing >= 90% fill are rejected
//! with `SYS_BUSY` and the next heartbeat cycle retries.
//!
//! Any RPC failure aborts the event quietly. The RPCs are idempotent at the
//! protocol level (a PS dedups by partition and replica), so the
//! heartbeat-driven retry converges without coordination.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::constants::{PARTITION_CHANNEL_LIMIT, PARTITION_CHANNEL_REJECT_PERCENT};
use crate::error::{Error, Result};
use crate::rpc::PsAdminClient;
use crate::types::{NodeId, PartitionId, Replica, ReplicaId};

use super::cluster::ControlPlane;
use super::partition::Partition;
use super::selector::Selector;

/// Work item for the processor.
pub enum ProcessorEvent {
    /// Place a new replica of the partition on a selected PS.
    Create(Arc<Partition>),
    /// Remove a replica through the partition's current leader.
    Delete {
        partition_id: PartitionId,
        leader_node: NodeId,
        replica: Replica,
    },
    /// Delete a partition the master has no record of, straight at the
    /// reporting PS.
    ForceDelete {
        partition_id: PartitionId,
        rpc_addr: String,
        replica: Replica,
    },
}

/// The long-lived event worker and its ingress.
pub struct PartitionProcessor {
    tx: mpsc::Sender<ProcessorEvent>,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionProcessor {
    /// Spawn the worker. `ps_client` performs the actual admin RPCs;
    /// `selector` chooses placement targets for create events.
    pub fn start(
        cluster: Arc<ControlPlane>,
        ps_client: Arc<dyn PsAdminClient>,
        selector: Arc<dyn Selector>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(PARTITION_CHANNEL_LIMIT);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let worker = tokio::spawn(run(cluster, ps_client, selector, rx, shutdown_rx));
        info!("partition processor started");

        Arc::new(PartitionProcessor {
            tx,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue an event. Fails fast with `SysBusy` above the fill threshold.
    pub fn push_event(&self, event: ProcessorEvent) -> Result<()> {
        let fill = PARTITION_CHANNEL_LIMIT - self.tx.capacity();
        if fill >= PARTITION_CHANNEL_LIMIT * PARTITION_CHANNEL_REJECT_PERCENT / 100 {
            warn!(fill, "partition channel near full, rejecting event");
            return Err(Error::SysBusy);
        }

        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::SysBusy,
            mpsc::error::TrySendError::Closed(_) => Error::ServerStop,
        })
    }

    /// Stop the worker and wait for in-flight events to drain.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.worker.lock().expect("processor worker poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("partition processor closed");
    }
}

async fn run(
    cluster: Arc<ControlPlane>,
    ps_client: Arc<dyn PsAdminClient>,
    selector: Arc<dyn Selector>,
    mut rx: mpsc::Receiver<ProcessorEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("partition processor received shutdown signal");
                break;
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                let cluster = cluster.clone();
                let ps_client = ps_client.clone();
                let selector = selector.clone();

                // Reap finished tasks opportunistically.
                while tasks.try_join_next().is_some() {}

                tasks.spawn(async move {
                    match event {
                        ProcessorEvent::Create(partition) => {
                            handle_create(&cluster, ps_client.as_ref(), selector.as_ref(), partition)
                                .await;
                        }
                        ProcessorEvent::Delete { partition_id, leader_node, replica } => {
                            handle_delete(&cluster, ps_client.as_ref(), partition_id, leader_node, replica)
                                .await;
                        }
                        ProcessorEvent::ForceDelete { partition_id, rpc_addr, replica } => {
                            handle_force_delete(ps_client.as_ref(), partition_id, &rpc_addr, replica)
                                .await;
                        }
                    }
                });
            }
        }
    }

    while tasks.join_next().await.is_some() {}
}

/// Select a PS, allocate a replica, and drive the create RPC sequence.
async fn handle_create(
    cluster: &ControlPlane,
    ps_client: &dyn PsAdminClient,
    selector: &dyn Selector,
    partition: Arc<Partition>,
) {
    let alive = cluster.ps_cache.alive_servers(cluster.config.ps_alive_timeout);
    let Some(target) = selector.select_target(&alive) else {
        error!(partition = %partition.id(), "no suitable ps for new replica");
        return;
    };

    // The leader PS is absent when the first replica of a partition is
    // placed.
    let leader_ps = cluster
        .ps_cache
        .find_server_by_id(partition.leader_node_id().await);

    let replica_id = match cluster.ids.next().await {
        Ok(id) => ReplicaId(id),
        Err(e) => {
            error!(partition = %partition.id(), error = %e, "failed to allocate replica id");
            return;
        }
    };
    let new_replica = Replica {
        id: replica_id,
        node_id: target.id(),
        addrs: target.addrs().clone(),
    };

    let mut copy = partition.meta().await;
    copy.replicas.push(new_replica.clone());
    if let Err(e) = ps_client.create_partition(target.rpc_addr(), copy).await {
        error!(
            partition = %partition.id(),
            node = %target.id(),
            error = %e,
            "rpc failed to create partition on ps"
        );
        return;
    }

    if let Some(leader_ps) = leader_ps {
        if let Err(e) = ps_client
            .add_replica(leader_ps.rpc_addr(), partition.id(), new_replica.clone())
            .await
        {
            error!(
                partition = %partition.id(),
                replica = %new_replica.id,
                error = %e,
                "rpc failed to add replica on leader ps"
            );
        }
    }
}

/// Remove a replica through the leader, then tear down its store.
async fn handle_delete(
    cluster: &ControlPlane,
    ps_client: &dyn PsAdminClient,
    partition_id: PartitionId,
    leader_node: NodeId,
    replica: Replica,
) {
    let Some(leader_ps) = cluster.ps_cache.find_server_by_id(leader_node) else {
        debug!(partition = %partition_id, "no leader ps known for replica delete");
        return;
    };
    let Some(target_ps) = cluster.ps_cache.find_server_by_id(replica.node_id) else {
        debug!(partition = %partition_id, node = %replica.node_id, "target ps for replica delete not found");
        return;
    };

    if let Err(e) = ps_client
        .remove_replica(leader_ps.rpc_addr(), partition_id, replica.clone())
        .await
    {
        error!(partition = %partition_id, replica = %replica.id, error = %e, "rpc failed to remove replica");
        return;
    }

    if let Err(e) = ps_client
        .delete_partition(target_ps.rpc_addr(), partition_id)
        .await
    {
        error!(partition = %partition_id, error = %e, "rpc failed to delete partition from ps");
    }
}

/// Delete a partition the master does not know, directly at the reporter.
async fn handle_force_delete(
    ps_client: &dyn PsAdminClient,
    partition_id: PartitionId,
    rpc_addr: &str,
    replica: Replica,
) {
    debug!(partition = %partition_id, replica = %replica.id, rpc_addr, "force deleting unknown partition");
    if let Err(e) = ps_client.delete_partition(rpc_addr, partition_id).await {
        error!(partition = %partition_id, error = %e, "rpc failed to force delete partition");
    }
}
