//! Centralized configuration and protocol constants.
//!
//! This module consolidates the magic numbers used throughout the zone-master
//! control plane and the partition-server lifecycle handler. Having them in
//! one place makes it easier to:
//!
//! - Understand the reconciliation timing contract
//! - Update values consistently
//! - Document the rationale for each constant

use std::time::Duration;

// =============================================================================
// Topology Store Key Prefixes
// =============================================================================
// Every durable record is stored under `"<prefix><decimal-id>"`. Prefix scans
// use `topo::keys::bytes_prefix` to derive the exclusive upper bound.

/// Key prefix for persisted partition records.
pub const PREFIX_PARTITION: &str = "schema partition ";

/// Key prefix for persisted database records.
pub const PREFIX_DB: &str = "schema db ";

/// Key prefix for persisted space records.
pub const PREFIX_SPACE: &str = "schema space ";

/// Key prefix for persisted partition-server records.
pub const PREFIX_PS: &str = "schema ps ";

/// Key holding the high watermark of the zone-wide ID allocator.
pub const KEY_ID_GENERATOR: &str = "schema id generator";

// =============================================================================
// Reconciliation
// =============================================================================

/// Default replica cardinality target per partition.
///
/// The reconciler emits create/delete events until the replica set of every
/// partition converges to this count. Overridden by
/// [`MasterConfig::replica_num`](crate::config::MasterConfig).
pub const DEFAULT_REPLICA_NUM: usize = 1;

/// Single-flight window of the per-partition change-member task latch.
///
/// Once a reconciliation event is emitted for a partition, further events are
/// suppressed until either the resulting update lands (which clears the
/// latch) or this window elapses. This is the reconciliation retry
/// granularity.
pub const CHANGE_MEMBER_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of routes returned by a single `GetRoute` call.
pub const ROUTE_FETCH_LIMIT: usize = 10;

// =============================================================================
// Partition Processor
// =============================================================================

/// Capacity of the partition processor's event channel.
pub const PARTITION_CHANNEL_LIMIT: usize = 1000;

/// Fill percentage at which event producers are rejected with `SYS_BUSY`.
///
/// Rejecting before the channel is completely full keeps headroom for events
/// already being produced concurrently; the next heartbeat cycle re-drives
/// anything that was shed.
pub const PARTITION_CHANNEL_REJECT_PERCENT: usize = 90;

// =============================================================================
// Partition Server
// =============================================================================

/// Capacity of the PS admin event channel.
///
/// Admin traffic is a low-rate plane; producers block when the channel is
/// full rather than shedding load.
pub const ADMIN_CHANNEL_LIMIT: usize = 64;

/// Per-attempt timeout for PS registration against the master.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum registration attempts before a PS gives up booting.
pub const REGISTER_MAX_RETRIES: usize = 10;

/// Default interval between PS heartbeats to the master.
pub const DEFAULT_PS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default bound on concurrent partition recoveries during PS boot.
pub const DEFAULT_RECOVER_CONCURRENCY: usize = 8;

// =============================================================================
// ID Allocator
// =============================================================================

/// Number of IDs claimed per topology-store write.
///
/// The allocator persists `high watermark + ID_ALLOC_STEP` and hands out IDs
/// from the claimed window without further I/O.
pub const ID_ALLOC_STEP: u64 = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_end_with_separator() {
        for prefix in [PREFIX_PARTITION, PREFIX_DB, PREFIX_SPACE, PREFIX_PS] {
            assert!(prefix.ends_with(' '), "prefix {prefix:?} must end with a space");
        }
    }

    #[test]
    fn reject_threshold_below_capacity() {
        assert!(PARTITION_CHANNEL_REJECT_PERCENT < 100);
        assert!(PARTITION_CHANNEL_LIMIT * PARTITION_CHANNEL_REJECT_PERCENT / 100 < PARTITION_CHANNEL_LIMIT);
    }
}
