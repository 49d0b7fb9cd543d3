//! End-to-end control loop: a real master service and real partition servers
//! wired together in-process, with the consensus module mocked at its seam.
//!
//! Covers the S1 convergence scenario, PS boot/diff/recover, duplicate
//! create dedup, and register-resume.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use baudengine::config::{MasterConfig, PsConfig};
use baudengine::error::RespCode;
use baudengine::master::{ControlPlane, IdleSelector, MasterService, PartitionProcessor};
use baudengine::protocol::{
    ChangeLeaderRequest, ChangeReplicaRequest, CreatePartitionRequest, ReplicaChange,
    RequestHeader,
};
use baudengine::ps::{MockConsensus, PsServer};
use baudengine::rpc::{LoopbackMasterClient, LoopbackPsClient};
use baudengine::topo::mem::MemTopoStore;
use baudengine::types::{NodeId, PartitionId, Replica, ReplicaId};

struct TestZone {
    cluster: Arc<ControlPlane>,
    service: Arc<MasterService>,
    ps_client: Arc<LoopbackPsClient>,
}

impl TestZone {
    fn new(replica_num: usize) -> Self {
        let config = MasterConfig { replica_num, ..Default::default() };
        let cluster = ControlPlane::new(config, Arc::new(MemTopoStore::new()));
        cluster.become_leader();

        let ps_client = Arc::new(LoopbackPsClient::new());
        let selector = Arc::new(IdleSelector::new());
        let processor =
            PartitionProcessor::start(cluster.clone(), ps_client.clone(), selector.clone());
        let service = MasterService::new(cluster.clone(), processor, ps_client.clone(), selector);

        TestZone { cluster, service, ps_client }
    }

    /// Boot a PS against this zone and make it reachable for admin RPCs.
    async fn boot_ps(
        &self,
        dir: &TempDir,
        consensus: Arc<MockConsensus>,
    ) -> Arc<PsServer> {
        let config = PsConfig {
            master_addr: "zm".into(),
            heartbeat_interval: Duration::from_millis(50),
            store_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let master = Arc::new(LoopbackMasterClient::new(self.service.clone()));
        let server = PsServer::new(config, consensus, Some(master)).unwrap();
        server.start().await.unwrap();

        // The master derived this node's addresses from its ip and the zone
        // port layout; mirror them in the loopback transport.
        let ps = self
            .cluster
            .ps_cache
            .find_server_by_id(server.node_id())
            .expect("ps registered");
        self.ps_client
            .register(ps.rpc_addr(), ps.admin_addr(), server.clone());

        server
    }
}

/// A PS with no master: no registration, no heartbeats. Used by the tests
/// that exercise the admin surface in isolation, where a reconciling master
/// would force-delete partitions it does not know about.
async fn standalone_ps(dir: &TempDir, consensus: Arc<MockConsensus>) -> Arc<PsServer> {
    let config = PsConfig { store_path: dir.path().to_path_buf(), ..Default::default() };
    let server = PsServer::new(config, consensus, None).unwrap();
    server.start().await.unwrap();
    server
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

// =============================================================================
// S1 end-to-end
// =============================================================================

#[tokio::test]
async fn admin_create_converges_to_one_replica() {
    let zone = TestZone::new(1);
    let db = zone.cluster.create_db("library").await.unwrap();
    let space = zone.cluster.create_space(db.id(), "books", 1).await.unwrap();
    let partition = space.multiple_search(baudengine::types::SlotId(0), 1)[0].clone();
    assert_eq!(partition.count_replicas().await, 0);

    let dir = TempDir::new().unwrap();
    let ps = zone.boot_ps(&dir, Arc::new(MockConsensus::new())).await;
    assert!(ps.node_id().is_assigned());

    // Admin places the first replica; the PS hosts it, triggers a
    // heartbeat, and the reconciler adopts the reported group.
    let resp = zone
        .service
        .create_partition(CreatePartitionRequest {
            header: RequestHeader::new(),
            partition: partition.meta().await,
        })
        .await;
    assert!(resp.header.is_ok());
    let allocated = resp.replica.unwrap();
    assert_eq!(allocated.node_id, ps.node_id());

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if partition.count_replicas().await == 1 && partition.leader().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for the replica set to converge");

    let meta = partition.meta().await;
    assert_eq!(meta.replicas[0].id, allocated.id);
    assert_eq!(meta.epoch.conf_version, 1);
    assert_eq!(partition.leader().await.unwrap().node_id, ps.node_id());

    ps.close().await;
    zone.service.close().await;
}

// =============================================================================
// Duplicate create dedup on PS
// =============================================================================

#[tokio::test]
async fn duplicate_create_over_live_store_is_noop() {
    let dir = TempDir::new().unwrap();
    let consensus = Arc::new(MockConsensus::new());
    let ps = standalone_ps(&dir, consensus.clone()).await;

    let meta = baudengine::types::PartitionMeta {
        id: PartitionId(77),
        replicas: vec![Replica {
            id: ReplicaId(5),
            node_id: ps.node_id(),
            ..Default::default()
        }],
        ..Default::default()
    };

    ps.create_partition(CreatePartitionRequest {
        header: RequestHeader::new(),
        partition: meta.clone(),
    })
    .await;
    {
        let ps = ps.clone();
        wait_until("partition to be hosted", move || ps.partition_count() == 1).await;
    }
    assert_eq!(ps.hosted_partitions(), vec![PartitionId(77)]);
    assert!(consensus.has_group(PartitionId(77)));

    // The duplicate is acknowledged but dropped by the event loop.
    let resp = ps
        .create_partition(CreatePartitionRequest {
            header: RequestHeader::new(),
            partition: meta,
        })
        .await;
    assert!(resp.header.is_ok());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ps.partition_count(), 1);

    ps.close().await;
}

// =============================================================================
// Membership and leadership admin guards
// =============================================================================

#[tokio::test]
async fn change_replica_requires_hosting_and_leadership() {
    let dir = TempDir::new().unwrap();
    let consensus = Arc::new(MockConsensus::new());
    let ps = standalone_ps(&dir, consensus.clone()).await;

    let replica = Replica { id: ReplicaId(9), node_id: NodeId(3), ..Default::default() };

    // Not hosted.
    let resp = ps
        .change_replica(ChangeReplicaRequest {
            header: RequestHeader::new(),
            partition_id: PartitionId(42),
            change: ReplicaChange::Add,
            replica: replica.clone(),
        })
        .await;
    assert_eq!(resp.header.code, RespCode::PsNoPartition);

    // Host it, then demote: membership changes need leadership.
    ps.create_partition(CreatePartitionRequest {
        header: RequestHeader::new(),
        partition: baudengine::types::PartitionMeta {
            id: PartitionId(42),
            replicas: vec![Replica {
                id: ReplicaId(1),
                node_id: ps.node_id(),
                ..Default::default()
            }],
            ..Default::default()
        },
    })
    .await;
    {
        let ps = ps.clone();
        wait_until("partition to be hosted", move || ps.partition_count() == 1).await;
    }

    consensus.set_leader(PartitionId(42), false);
    let resp = ps
        .change_replica(ChangeReplicaRequest {
            header: RequestHeader::new(),
            partition_id: PartitionId(42),
            change: ReplicaChange::Add,
            replica: replica.clone(),
        })
        .await;
    assert_eq!(resp.header.code, RespCode::PsNotLeader);

    consensus.set_leader(PartitionId(42), true);
    let resp = ps
        .change_replica(ChangeReplicaRequest {
            header: RequestHeader::new(),
            partition_id: PartitionId(42),
            change: ReplicaChange::Add,
            replica,
        })
        .await;
    assert!(resp.header.is_ok());
    assert_eq!(consensus.changes().len(), 1);

    ps.close().await;
}

#[tokio::test]
async fn change_leader_reaches_consensus_module() {
    let dir = TempDir::new().unwrap();
    let consensus = Arc::new(MockConsensus::new());
    let ps = standalone_ps(&dir, consensus.clone()).await;

    let resp = ps
        .change_leader(ChangeLeaderRequest {
            header: RequestHeader::new(),
            partition_id: PartitionId(42),
        })
        .await;
    assert_eq!(resp.header.code, RespCode::PsNoPartition);

    ps.create_partition(CreatePartitionRequest {
        header: RequestHeader::new(),
        partition: baudengine::types::PartitionMeta {
            id: PartitionId(42),
            replicas: vec![Replica {
                id: ReplicaId(1),
                node_id: ps.node_id(),
                ..Default::default()
            }],
            ..Default::default()
        },
    })
    .await;
    {
        let ps = ps.clone();
        wait_until("partition to be hosted", move || ps.partition_count() == 1).await;
    }

    let resp = ps
        .change_leader(ChangeLeaderRequest {
            header: RequestHeader::new(),
            partition_id: PartitionId(42),
        })
        .await;
    assert!(resp.header.is_ok());
    assert_eq!(consensus.leader_transfers(), vec![PartitionId(42)]);

    ps.close().await;
}

// =============================================================================
// Register resume
// =============================================================================

#[tokio::test]
async fn rebooted_ps_keeps_identity() {
    let zone = TestZone::new(1);
    let dir = TempDir::new().unwrap();

    let ps = zone.boot_ps(&dir, Arc::new(MockConsensus::new())).await;
    let first_id = ps.node_id();
    assert!(first_id.is_assigned());
    ps.close().await;

    // Same store path: the node resumes its identity instead of allocating
    // a new one.
    let ps = zone.boot_ps(&dir, Arc::new(MockConsensus::new())).await;
    assert_eq!(ps.node_id(), first_id);

    ps.close().await;
    zone.service.close().await;
}

#[tokio::test]
async fn unknown_resumed_identity_is_rejected() {
    let zone = TestZone::new(1);

    let resp = zone
        .service
        .ps_register(baudengine::protocol::PsRegisterRequest {
            header: RequestHeader::new(),
            node_id: NodeId(424242),
            ip: "10.0.0.9".into(),
            ..Default::default()
        })
        .await;
    assert_eq!(resp.header.code, RespCode::PsNotExists);

    zone.service.close().await;
}
