//! # BaudEngine control plane
//!
//! BaudEngine is a sharded, replicated search-and-storage cluster. Documents
//! live in *spaces* partitioned across a 32-bit slot keyspace; each partition
//! is a replicated state machine hosted by partition servers (PS). This
//! crate is the cluster's control plane:
//!
//! - the **zone master** ([`master`]): the partition/replica metadata model,
//!   the heartbeat-driven reconciliation state machine, and the asynchronous
//!   partition processor that mutates remote PS state;
//! - the **PS lifecycle handler** ([`ps`]): admin events binding partitions
//!   to the consensus module, registration, and heartbeats;
//! - the **routing tree** ([`master::partition_tree`]): slot -> partition
//!   resolution behind `GetRoute`.
//!
//! ```text
//!          clients                         partition servers
//!             │ GetRoute                        │ PSRegister / PSHeartbeat
//!             ▼                                 ▼
//!        ┌─────────────────────────────────────────────┐
//!        │              zone master (leader)           │
//!        │  caches ── reconciler ── partition processor│──▶ PS admin RPCs
//!        └──────────────────────┬──────────────────────┘
//!                               ▼
//!                        topology store
//! ```
//!
//! The storage engine behind partitions, the consensus implementation, the
//! topology store, and the gRPC wire plumbing are external collaborators;
//! the crate consumes them through the seams in [`topo`], [`ps::consensus`],
//! and [`rpc`]. Convergence is heartbeat-driven and monotonic: every
//! decision either advances the persisted record or is re-driven by the next
//! beat.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use baudengine::config::MasterConfig;
//! use baudengine::master::{ControlPlane, IdleSelector, MasterService, PartitionProcessor};
//! use baudengine::rpc::PsAdminClient;
//!
//! # async fn run(topo: Arc<dyn baudengine::topo::TopoStore>, ps_client: Arc<dyn PsAdminClient>) -> baudengine::error::Result<()> {
//! let cluster = ControlPlane::new(MasterConfig::from_env()?, topo);
//! cluster.recover().await?;
//! cluster.become_leader();
//!
//! let selector = Arc::new(IdleSelector::new());
//! let processor = PartitionProcessor::start(cluster.clone(), ps_client.clone(), selector.clone());
//! let service = MasterService::new(cluster, processor, ps_client, selector);
//! // hand `service` to the rpc layer
//! # drop(service);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod constants;
pub mod error;
pub mod master;
pub mod protocol;
pub mod ps;
pub mod rpc;
pub mod telemetry;
pub mod topo;
pub mod types;

pub mod prelude {
    //! Commonly used control-plane types.

    pub use crate::config::{MasterConfig, PsConfig};
    pub use crate::error::{Error, RespCode, Result};
    pub use crate::master::{ControlPlane, IdleSelector, MasterService, PartitionProcessor};
    pub use crate::protocol::{PartitionInfo, RequestHeader, ResponseHeader};
    pub use crate::ps::PsServer;
    pub use crate::types::{
        DbId, Epoch, NodeId, PartitionId, PartitionMeta, PartitionStatus, Replica, ReplicaId,
        SlotId, SpaceId,
    };
}
