//! PS admin surface.
//!
//! Create and delete requests are acknowledged immediately and executed by a
//! single-threaded event loop over a bounded channel: admin is a low-rate
//! plane, so producers block when the channel is full rather than shedding.
//! Membership and leadership changes are answered inline because they need
//! the partition's current consensus state.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use crate::error::Error;
use crate::protocol::{
    ChangeLeaderRequest, ChangeLeaderResponse, ChangeReplicaRequest, ChangeReplicaResponse,
    CreatePartitionRequest, CreatePartitionResponse, DeletePartitionRequest,
    DeletePartitionResponse, ResponseHeader,
};
use crate::types::{PartitionId, PartitionMeta, PartitionStatus};

use super::server::PsServer;
use super::store::PartitionStore;

/// Lifecycle work handled by the admin event loop.
pub enum AdminEvent {
    Create(PartitionMeta),
    Delete(PartitionId),
}

impl PsServer {
    // ========================================================================
    // Admin RPC handlers
    // ========================================================================

    /// Enqueue a partition create. Idempotent: a duplicate create over a
    /// live non-`Invalid` store is dropped by the event loop.
    pub async fn create_partition(&self, req: CreatePartitionRequest) -> CreatePartitionResponse {
        debug!(partition = %req.partition.id, "create partition request received");

        if self.is_stopping() {
            return CreatePartitionResponse {
                header: ResponseHeader::from_error(&req.header.req_id, &Error::ServerStop),
                replica: None,
            };
        }

        let req_id = req.header.req_id.clone();
        let _ = self.admin_tx().send(AdminEvent::Create(req.partition)).await;
        CreatePartitionResponse { header: ResponseHeader::ok(&req_id), replica: None }
    }

    /// Enqueue a partition delete.
    pub async fn delete_partition(&self, req: DeletePartitionRequest) -> DeletePartitionResponse {
        debug!(partition = %req.partition_id, "delete partition request received");

        if self.is_stopping() {
            return DeletePartitionResponse {
                header: ResponseHeader::from_error(&req.header.req_id, &Error::ServerStop),
            };
        }

        let _ = self.admin_tx().send(AdminEvent::Delete(req.partition_id)).await;
        DeletePartitionResponse { header: ResponseHeader::ok(&req.header.req_id) }
    }

    /// Apply a membership change through the hosted partition's consensus
    /// group. Must be addressed to the group's leader.
    pub async fn change_replica(&self, req: ChangeReplicaRequest) -> ChangeReplicaResponse {
        let req_id = &req.header.req_id;

        if self.is_stopping() {
            return ChangeReplicaResponse {
                header: ResponseHeader::from_error(req_id, &Error::ServerStop),
            };
        }
        let Some(store) = self.find_store(req.partition_id) else {
            return ChangeReplicaResponse {
                header: ResponseHeader::from_error(req_id, &Error::PsNoPartition),
            };
        };
        if !store.is_leader() {
            return ChangeReplicaResponse {
                header: ResponseHeader::from_error(req_id, &Error::PsNotLeader),
            };
        }

        match store.change_member(req.change, req.replica).await {
            Ok(()) => ChangeReplicaResponse { header: ResponseHeader::ok(req_id) },
            Err(e) => {
                error!(partition = %req.partition_id, error = %e, "change replica failed");
                ChangeReplicaResponse { header: ResponseHeader::from_error(req_id, &e) }
            }
        }
    }

    /// Ask the hosted partition's consensus group to move leadership here.
    pub async fn change_leader(&self, req: ChangeLeaderRequest) -> ChangeLeaderResponse {
        let req_id = &req.header.req_id;

        if self.is_stopping() {
            return ChangeLeaderResponse {
                header: ResponseHeader::from_error(req_id, &Error::ServerStop),
            };
        }
        let Some(store) = self.find_store(req.partition_id) else {
            return ChangeLeaderResponse {
                header: ResponseHeader::from_error(req_id, &Error::PsNoPartition),
            };
        };

        match store.try_to_leader().await {
            Ok(()) => ChangeLeaderResponse { header: ResponseHeader::ok(req_id) },
            Err(e) => {
                error!(partition = %req.partition_id, error = %e, "change leader failed");
                ChangeLeaderResponse { header: ResponseHeader::from_error(req_id, &e) }
            }
        }
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    pub(super) async fn do_admin_event(&self, event: AdminEvent) {
        if self.is_stopping() {
            return;
        }

        match event {
            AdminEvent::Create(meta) => {
                if let Some(store) = self.find_store(meta.id) {
                    // Dedup: a live store wins unless it was invalidated.
                    if store.status() != PartitionStatus::Invalid {
                        debug!(partition = %meta.id, "duplicate create over a live store, dropping");
                        return;
                    }
                    self.do_partition_delete(meta.id).await;
                }

                self.do_partition_create(meta).await;
                self.trigger_heartbeat();
            }
            AdminEvent::Delete(id) => {
                self.do_partition_delete(id).await;
                self.trigger_heartbeat();
            }
        }
    }

    /// Build a store, publish it, couple it to consensus, and persist its
    /// meta.
    pub(super) async fn do_partition_create(&self, meta: PartitionMeta) {
        let id = meta.id;
        let store = Arc::new(PartitionStore::new(
            meta,
            self.node_id(),
            self.consensus(),
            self.resolver(),
        ));

        // A concurrent create of the same partition loses; the published
        // store stays.
        if self.publish_store(store.clone()).is_err() {
            debug!(partition = %id, "partition already hosted");
            return;
        }

        if let Err(e) = store.start().await {
            error!(partition = %id, error = %e, "failed to start partition store");
            return;
        }
        if let Err(e) = self.server_meta().save_partition(&store.meta()) {
            error!(partition = %id, error = %e, "failed to persist partition meta");
        }
        info!(partition = %id, "partition created");
    }

    /// Close a hosted partition, unregister its peers, and clear its
    /// persisted meta.
    pub(super) async fn do_partition_delete(&self, id: PartitionId) {
        if let Some(store) = self.unpublish_store(id) {
            let meta = store.meta();
            store.close().await;
            for replica in &meta.replicas {
                self.resolver().delete_node(replica.node_id);
            }
            info!(partition = %id, "partition deleted");
        }

        self.server_meta().clear(id);
    }
}

/// The single-threaded admin worker.
pub(super) fn spawn_admin_loop(
    server: Arc<PsServer>,
    mut rx: mpsc::Receiver<AdminEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(node = %server.node_id(), "admin loop received shutdown signal");
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    server.do_admin_event(event).await;
                }
            }
        }
    })
}
