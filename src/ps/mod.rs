//! Partition-server side of the control plane.
//!
//! A PS hosts replicated partition state machines. This module covers the
//! control-plane half: registration and heartbeats against the zone master,
//! the admin surface the master drives, and the binding of each hosted
//! partition to the consensus module. The document engine behind each
//! partition is an external collaborator.

pub mod admin;
pub mod consensus;
pub mod heartbeat;
pub mod meta;
pub mod server;
pub mod store;

pub use admin::AdminEvent;
#[cfg(any(test, feature = "test-utilities"))]
pub use consensus::MockConsensus;
pub use consensus::{ConsensusModule, RaftResolver};
pub use meta::{MetaInfo, ServerMeta};
pub use server::PsServer;
pub use store::PartitionStore;
