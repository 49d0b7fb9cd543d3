//! Zone-master RPC surface.
//!
//! One method per control-plane RPC, each taking a request struct and
//! returning its response struct; the gRPC layer that frames these on the
//! wire lives outside the crate. Every mutating RPC is leader-gated:
//! non-leaders answer `MASTER_NOT_LEADER` with the current leader hint and
//! the caller re-targets.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    ChangeLeaderRequest, ChangeLeaderResponse, ChangeReplicaRequest, ChangeReplicaResponse,
    CreatePartitionRequest, CreatePartitionResponse, DeletePartitionRequest,
    DeletePartitionResponse, GetDbRequest, GetDbResponse, GetRouteRequest, GetRouteResponse,
    GetSpaceRequest, GetSpaceResponse, PsHeartbeatRequest, PsHeartbeatResponse,
    PsRegisterRequest, PsRegisterResponse, ReplicaChange, ResponseHeader, Route,
};
use crate::constants::ROUTE_FETCH_LIMIT;
use crate::rpc::PsAdminClient;
use crate::types::{NodeId, PsStatus, Replica, ReplicaId};

use super::cache::PartitionServer;
use super::cluster::ControlPlane;
use super::partition::Partition;
use super::processor::PartitionProcessor;
use super::reconciler;
use super::selector::Selector;

/// The zone-master RPC service.
pub struct MasterService {
    cluster: Arc<ControlPlane>,
    processor: Arc<PartitionProcessor>,
    ps_client: Arc<dyn PsAdminClient>,
    selector: Arc<dyn Selector>,
}

impl MasterService {
    pub fn new(
        cluster: Arc<ControlPlane>,
        processor: Arc<PartitionProcessor>,
        ps_client: Arc<dyn PsAdminClient>,
        selector: Arc<dyn Selector>,
    ) -> Arc<Self> {
        Arc::new(MasterService { cluster, processor, ps_client, selector })
    }

    pub fn cluster(&self) -> &Arc<ControlPlane> {
        &self.cluster
    }

    /// Stop the processor and release owned workers.
    pub async fn close(&self) {
        self.processor.close().await;
    }

    fn gate_leader(&self) -> Result<()> {
        if self.cluster.mine_is_leader() {
            Ok(())
        } else {
            Err(self.cluster.not_leader_error())
        }
    }

    // ========================================================================
    // Partition administration
    // ========================================================================

    /// Allocate one replica of the request's partition on a selected PS.
    pub async fn create_partition(&self, req: CreatePartitionRequest) -> CreatePartitionResponse {
        let req_id = &req.header.req_id;
        if let Err(e) = self.gate_leader() {
            return CreatePartitionResponse {
                header: ResponseHeader::from_error(req_id, &e),
                replica: None,
            };
        }

        match self.do_create_partition(&req).await {
            Ok(replica) => CreatePartitionResponse {
                header: ResponseHeader::ok(req_id),
                replica: Some(replica),
            },
            Err(e) => {
                error!(partition = %req.partition.id, error = %e, "create partition failed");
                CreatePartitionResponse {
                    header: ResponseHeader::from_error(req_id, &e),
                    replica: None,
                }
            }
        }
    }

    async fn do_create_partition(&self, req: &CreatePartitionRequest) -> Result<Replica> {
        let replica_id = ReplicaId(self.cluster.ids.next().await?);

        let alive = self
            .cluster
            .ps_cache
            .alive_servers(self.cluster.config.ps_alive_timeout);
        let target = self
            .selector
            .select_target(&alive)
            .ok_or_else(|| Error::Internal("no suitable ps node".into()))?;

        let replica = Replica {
            id: replica_id,
            node_id: target.id(),
            addrs: target.addrs().clone(),
        };

        let mut copy = req.partition.clone();
        copy.replicas.push(replica.clone());
        self.ps_client
            .create_partition(target.rpc_addr(), copy)
            .await?;

        Ok(replica)
    }

    /// Leader-targeted partition delete.
    pub async fn delete_partition(&self, req: DeletePartitionRequest) -> DeletePartitionResponse {
        let req_id = &req.header.req_id;
        if let Err(e) = self.gate_leader() {
            return DeletePartitionResponse { header: ResponseHeader::from_error(req_id, &e) };
        }

        let result = async {
            let (_, leader_ps) = self.find_partition_leader(req.partition_id).await?;
            self.ps_client
                .delete_partition(leader_ps.rpc_addr(), req.partition_id)
                .await
        }
        .await;

        DeletePartitionResponse {
            header: match result {
                Ok(()) => ResponseHeader::ok(req_id),
                Err(e) => {
                    error!(partition = %req.partition_id, error = %e, "delete partition failed");
                    ResponseHeader::from_error(req_id, &e)
                }
            },
        }
    }

    /// Route an add/remove member change through the partition's leader PS.
    pub async fn change_replica(&self, req: ChangeReplicaRequest) -> ChangeReplicaResponse {
        let req_id = &req.header.req_id;
        if let Err(e) = self.gate_leader() {
            return ChangeReplicaResponse { header: ResponseHeader::from_error(req_id, &e) };
        }

        let result = async {
            let (_, leader_ps) = self.find_partition_leader(req.partition_id).await?;
            match req.change {
                ReplicaChange::Add => {
                    self.ps_client
                        .add_replica(leader_ps.rpc_addr(), req.partition_id, req.replica.clone())
                        .await
                }
                ReplicaChange::Remove => {
                    self.ps_client
                        .remove_replica(leader_ps.rpc_addr(), req.partition_id, req.replica.clone())
                        .await
                }
            }
        }
        .await;

        ChangeReplicaResponse {
            header: match result {
                Ok(()) => ResponseHeader::ok(req_id),
                Err(e) => {
                    error!(partition = %req.partition_id, error = %e, "change replica failed");
                    ResponseHeader::from_error(req_id, &e)
                }
            },
        }
    }

    /// Ask the partition's current leader PS to hand leadership over.
    pub async fn change_leader(&self, req: ChangeLeaderRequest) -> ChangeLeaderResponse {
        let req_id = &req.header.req_id;
        if let Err(e) = self.gate_leader() {
            return ChangeLeaderResponse { header: ResponseHeader::from_error(req_id, &e) };
        }

        let result = async {
            let (_, leader_ps) = self.find_partition_leader(req.partition_id).await?;
            self.ps_client
                .change_leader(leader_ps.rpc_addr(), req.partition_id)
                .await
        }
        .await;

        ChangeLeaderResponse {
            header: match result {
                Ok(()) => ResponseHeader::ok(req_id),
                Err(e) => {
                    error!(partition = %req.partition_id, error = %e, "change leader failed");
                    ResponseHeader::from_error(req_id, &e)
                }
            },
        }
    }

    async fn find_partition_leader(
        &self,
        partition_id: crate::types::PartitionId,
    ) -> Result<(Arc<Partition>, Arc<PartitionServer>)> {
        let partition = self
            .cluster
            .partition_cache
            .find_partition_by_id(partition_id)
            .ok_or(Error::PartitionNotExists)?;
        let leader_node = partition.leader_node_id().await;
        let leader_ps = self
            .cluster
            .ps_cache
            .find_server_by_id(leader_node)
            .ok_or(Error::NoLeader)?;
        Ok((partition, leader_ps))
    }

    // ========================================================================
    // Routing & metadata
    // ========================================================================

    /// Resolve the partitions serving `slot` and their host nodes.
    pub async fn get_route(&self, req: GetRouteRequest) -> GetRouteResponse {
        let req_id = &req.header.req_id;

        let space = match self.cluster.find_space(req.db, req.space) {
            Ok(space) => space,
            Err(e) => {
                return GetRouteResponse {
                    header: ResponseHeader::from_error(req_id, &e),
                    routes: Vec::new(),
                }
            }
        };

        let partitions = space.multiple_search(req.slot, ROUTE_FETCH_LIMIT);
        if partitions.is_empty() {
            return GetRouteResponse {
                header: ResponseHeader::from_error(req_id, &Error::RouteNotFound),
                routes: Vec::new(),
            };
        }

        let mut routes = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let meta = partition.meta().await;
            let leader_node = partition.leader_node_id().await;

            let nodes = meta
                .replicas
                .iter()
                .filter_map(|r| self.cluster.ps_cache.find_server_by_id(r.node_id))
                .map(|ps| ps.node().clone())
                .collect();

            routes.push(Route {
                partition: meta,
                leader: leader_node.is_assigned().then_some(leader_node),
                nodes,
            });
        }

        debug!(db = %req.db, space = %req.space, slot = %req.slot, routes = routes.len(), "resolved routes");
        GetRouteResponse { header: ResponseHeader::ok(req_id), routes }
    }

    pub async fn get_db(&self, req: GetDbRequest) -> GetDbResponse {
        let req_id = &req.header.req_id;
        match self.cluster.db_cache.find_db_by_name(&req.db_name) {
            Some(db) => GetDbResponse {
                header: ResponseHeader::ok(req_id),
                db: Some(db.meta().clone()),
            },
            None => GetDbResponse {
                header: ResponseHeader::from_error(req_id, &Error::DbNotExists),
                db: None,
            },
        }
    }

    pub async fn get_space(&self, req: GetSpaceRequest) -> GetSpaceResponse {
        let req_id = &req.header.req_id;

        let Some(db) = self.cluster.db_cache.find_db_by_id(req.db) else {
            return GetSpaceResponse {
                header: ResponseHeader::from_error(req_id, &Error::DbNotExists),
                space: None,
            };
        };
        match db.spaces().find_space_by_name(&req.space_name) {
            Some(space) => GetSpaceResponse {
                header: ResponseHeader::ok(req_id),
                space: Some(space.meta().clone()),
            },
            None => GetSpaceResponse {
                header: ResponseHeader::from_error(req_id, &Error::SpaceNotExists),
                space: None,
            },
        }
    }

    // ========================================================================
    // PS plane
    // ========================================================================

    /// Register a PS. `node_id == 0` allocates a fresh identity; a non-zero
    /// id resumes the node's previous one and hands back its owned
    /// partitions for diff-and-recover.
    pub async fn ps_register(&self, req: PsRegisterRequest) -> PsRegisterResponse {
        let req_id = &req.header.req_id;
        if let Err(e) = self.gate_leader() {
            return PsRegisterResponse {
                header: ResponseHeader::from_error(req_id, &e),
                ..Default::default()
            };
        }

        if !req.node_id.is_assigned() {
            return match self.register_new_ps(&req).await {
                Ok(ps) => {
                    debug!(node = %ps.id(), ip = ps.ip(), "new ps registered");
                    PsRegisterResponse {
                        header: ResponseHeader::ok(req_id),
                        node_id: ps.id(),
                        partitions: Vec::new(),
                    }
                }
                Err(e) => {
                    error!(ip = req.ip, error = %e, "ps registration failed");
                    PsRegisterResponse {
                        header: ResponseHeader::from_error(req_id, &e),
                        ..Default::default()
                    }
                }
            };
        }

        // A node resuming an identity the master never issued is rejected.
        let Some(ps) = self.cluster.ps_cache.find_server_by_id(req.node_id) else {
            warn!(node = %req.node_id, "unknown ps tried to resume registration");
            return PsRegisterResponse {
                header: ResponseHeader::from_error(req_id, &Error::PsNotExists),
                ..Default::default()
            };
        };

        ps.change_status(PsStatus::Registered);
        let mut partitions = Vec::new();
        for partition in ps.partitions() {
            partitions.push(partition.meta().await);
        }
        debug!(node = %ps.id(), partitions = partitions.len(), "ps resumed registration");

        PsRegisterResponse {
            header: ResponseHeader::ok(req_id),
            node_id: ps.id(),
            partitions,
        }
    }

    async fn register_new_ps(&self, req: &PsRegisterRequest) -> Result<Arc<PartitionServer>> {
        // Re-registration from the same address reuses the record.
        if let Some(existing) = self.cluster.ps_cache.find_server_by_ip(&req.ip) {
            existing.change_status(PsStatus::Registered);
            return Ok(existing);
        }

        let id = NodeId(self.cluster.ids.next().await?);
        let ps = Arc::new(PartitionServer::new(id, &req.ip, &self.cluster.config.ps_ports));
        ps.persist(self.cluster.topo.as_ref()).await?;
        ps.change_status(PsStatus::Registered);
        self.cluster.ps_cache.add_server(ps.clone());
        Ok(ps)
    }

    /// Accept a heartbeat and run reconciliation over its reports.
    pub async fn ps_heartbeat(&self, req: PsHeartbeatRequest) -> PsHeartbeatResponse {
        let req_id = &req.header.req_id;
        if let Err(e) = self.gate_leader() {
            return PsHeartbeatResponse { header: ResponseHeader::from_error(req_id, &e) };
        }

        let Some(ps) = self.cluster.ps_cache.find_server_by_id(req.node_id) else {
            error!(node = %req.node_id, "heartbeat from unknown ps");
            return PsHeartbeatResponse {
                header: ResponseHeader::from_error(req_id, &Error::PsNotExists),
            };
        };
        ps.update_heartbeat();

        if !req.partitions.is_empty() {
            reconciler::process_heartbeat(&self.cluster, &self.processor, &ps, &req).await;
        }

        // Reconciliation outcomes are not surfaced; the next heartbeat
        // re-drives convergence.
        PsHeartbeatResponse { header: ResponseHeader::ok(req_id) }
    }
}
