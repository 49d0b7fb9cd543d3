//! Zone-master control plane.
//!
//! The master owns the cluster metadata — databases, spaces, partitions,
//! replicas, PS nodes — and keeps the actual replica layout converging
//! toward the intended one:
//!
//! ```text
//!   PS heartbeat ──> MasterService ──> reconciler ──┐
//!                        │                          │ events
//!                        │ lookups                  ▼
//!                   ControlPlane <── PartitionProcessor ──> PS admin RPCs
//!                   (caches + topo)
//! ```
//!
//! Per-partition decisions are serialized by the record's write lock and the
//! 30-second task latch; cross-partition work interleaves freely. The
//! processor only issues idempotent RPCs — the resulting state changes come
//! back through the next heartbeat.

pub mod cache;
pub mod cluster;
pub mod partition;
pub mod partition_tree;
pub mod processor;
pub mod reconciler;
pub mod selector;
pub mod service;

pub use cache::{Db, DbCache, PartitionServer, PsCache, Space, SpaceCache};
pub use cluster::ControlPlane;
pub use partition::{Partition, PartitionCache};
pub use partition_tree::PartitionTree;
pub use processor::{PartitionProcessor, ProcessorEvent};
pub use selector::{IdleSelector, Selector};
pub use service::MasterService;
