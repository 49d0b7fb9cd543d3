//! RPC seams between the zone master, the partition servers, and clients.
//!
//! The gRPC wire plumbing, connection pools, and retry policies live outside
//! this crate; components talk through these traits. The loopback
//! implementations (behind the `test-utilities` feature) wire a master and a
//! set of partition servers together in-process, which is how the
//! integration tests exercise the full control loop.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::protocol::{PsHeartbeatRequest, PsHeartbeatResponse, PsRegisterRequest, PsRegisterResponse};
use crate::types::{PartitionId, PartitionMeta, Replica};

/// Client surface the master uses to drive partition servers.
///
/// All operations are idempotent at the protocol level: a PS dedups by
/// `(partition, replica)`, so replays caused by heartbeat-driven retries are
/// safe.
#[async_trait]
pub trait PsAdminClient: Send + Sync {
    /// Build a partition store on the addressed PS. The meta already carries
    /// the replica placed there.
    async fn create_partition(&self, addr: &str, partition: PartitionMeta) -> Result<()>;

    /// Tear down a partition store on the addressed PS.
    async fn delete_partition(&self, addr: &str, partition_id: PartitionId) -> Result<()>;

    /// Ask the partition's leader PS to add a member to the consensus group.
    async fn add_replica(&self, addr: &str, partition_id: PartitionId, replica: Replica)
        -> Result<()>;

    /// Ask the partition's leader PS to remove a member from the consensus
    /// group.
    async fn remove_replica(
        &self,
        addr: &str,
        partition_id: PartitionId,
        replica: Replica,
    ) -> Result<()>;

    /// Ask the addressed PS to transfer leadership to itself.
    async fn change_leader(&self, addr: &str, partition_id: PartitionId) -> Result<()>;
}

/// Client surface a partition server uses to reach the zone master.
#[async_trait]
pub trait MasterClient: Send + Sync {
    async fn ps_register(&self, addr: &str, req: PsRegisterRequest) -> Result<PsRegisterResponse>;

    async fn ps_heartbeat(&self, addr: &str, req: PsHeartbeatRequest)
        -> Result<PsHeartbeatResponse>;
}

#[cfg(any(test, feature = "test-utilities"))]
pub use loopback::{LoopbackMasterClient, LoopbackPsClient};

#[cfg(any(test, feature = "test-utilities"))]
mod loopback {
    use std::sync::Arc;

    use dashmap::DashMap;

    use super::*;
    use crate::master::service::MasterService;
    use crate::protocol::{
        ChangeLeaderRequest, ChangeReplicaRequest, CreatePartitionRequest, DeletePartitionRequest,
        ReplicaChange, RequestHeader, ResponseHeader,
    };
    use crate::ps::server::PsServer;

    fn check(header: &ResponseHeader) -> Result<()> {
        if header.is_ok() {
            Ok(())
        } else {
            Err(Error::Rpc(format!("{:?}: {}", header.code, header.message)))
        }
    }

    /// In-process [`PsAdminClient`] dispatching on the PS admin address.
    #[derive(Default)]
    pub struct LoopbackPsClient {
        servers: DashMap<String, Arc<PsServer>>,
    }

    impl LoopbackPsClient {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make a PS reachable under both its rpc and admin addresses.
        pub fn register(&self, rpc_addr: &str, admin_addr: &str, server: Arc<PsServer>) {
            self.servers.insert(rpc_addr.to_string(), server.clone());
            self.servers.insert(admin_addr.to_string(), server);
        }

        fn resolve(&self, addr: &str) -> Result<Arc<PsServer>> {
            self.servers
                .get(addr)
                .map(|s| s.value().clone())
                .ok_or_else(|| Error::Rpc(format!("no ps listening on {addr}")))
        }
    }

    #[async_trait]
    impl PsAdminClient for LoopbackPsClient {
        async fn create_partition(&self, addr: &str, partition: PartitionMeta) -> Result<()> {
            let server = self.resolve(addr)?;
            let resp = server
                .create_partition(CreatePartitionRequest {
                    header: RequestHeader::new(),
                    partition,
                })
                .await;
            check(&resp.header)
        }

        async fn delete_partition(&self, addr: &str, partition_id: PartitionId) -> Result<()> {
            let server = self.resolve(addr)?;
            let resp = server
                .delete_partition(DeletePartitionRequest {
                    header: RequestHeader::new(),
                    partition_id,
                })
                .await;
            check(&resp.header)
        }

        async fn add_replica(
            &self,
            addr: &str,
            partition_id: PartitionId,
            replica: Replica,
        ) -> Result<()> {
            let server = self.resolve(addr)?;
            let resp = server
                .change_replica(ChangeReplicaRequest {
                    header: RequestHeader::new(),
                    partition_id,
                    change: ReplicaChange::Add,
                    replica,
                })
                .await;
            check(&resp.header)
        }

        async fn remove_replica(
            &self,
            addr: &str,
            partition_id: PartitionId,
            replica: Replica,
        ) -> Result<()> {
            let server = self.resolve(addr)?;
            let resp = server
                .change_replica(ChangeReplicaRequest {
                    header: RequestHeader::new(),
                    partition_id,
                    change: ReplicaChange::Remove,
                    replica,
                })
                .await;
            check(&resp.header)
        }

        async fn change_leader(&self, addr: &str, partition_id: PartitionId) -> Result<()> {
            let server = self.resolve(addr)?;
            let resp = server
                .change_leader(ChangeLeaderRequest {
                    header: RequestHeader::new(),
                    partition_id,
                })
                .await;
            check(&resp.header)
        }
    }

    /// In-process [`MasterClient`] bound to one master service.
    pub struct LoopbackMasterClient {
        service: Arc<MasterService>,
    }

    impl LoopbackMasterClient {
        pub fn new(service: Arc<MasterService>) -> Self {
            LoopbackMasterClient { service }
        }
    }

    #[async_trait]
    impl MasterClient for LoopbackMasterClient {
        async fn ps_register(
            &self,
            _addr: &str,
            req: PsRegisterRequest,
        ) -> Result<PsRegisterResponse> {
            Ok(self.service.ps_register(req).await)
        }

        async fn ps_heartbeat(
            &self,
            _addr: &str,
            req: PsHeartbeatRequest,
        ) -> Result<PsHeartbeatResponse> {
            Ok(self.service.ps_heartbeat(req).await)
        }
    }
}
