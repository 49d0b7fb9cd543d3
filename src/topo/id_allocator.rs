//! Zone-wide monotonic ID allocation.
//!
//! A single-writer counter persisted in the topology store. IDs are claimed
//! in batches of [`ID_ALLOC_STEP`]: one store write moves the persisted high
//! watermark forward, then allocations are handed out from the claimed
//! window without further I/O. IDs therefore survive restarts (a restart
//! skips at most one unclaimed window) and never repeat.
//!
//! Only the zone-master leader allocates; the batch state is serialized by a
//! mutex rather than compare-and-set.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::constants::{ID_ALLOC_STEP, KEY_ID_GENERATOR};
use crate::error::{Error, Result};

use super::{TopoError, TopoStore};

#[derive(Default)]
struct Window {
    /// Next ID to hand out.
    current: u64,
    /// Exclusive end of the claimed window.
    end: u64,
}

/// Batch-allocating monotonic ID source.
pub struct IdAllocator {
    topo: Arc<dyn TopoStore>,
    window: Mutex<Window>,
}

impl IdAllocator {
    pub fn new(topo: Arc<dyn TopoStore>) -> Self {
        IdAllocator { topo, window: Mutex::new(Window::default()) }
    }

    /// Allocate the next zone-unique ID. Never returns 0.
    pub async fn next(&self) -> Result<u64> {
        let mut window = self.window.lock().await;

        if window.current >= window.end {
            let base = match self.topo.get(KEY_ID_GENERATOR).await {
                Ok((value, _)) => decode_watermark(&value)?,
                Err(TopoError::NoNode) => 0,
                Err(e) => {
                    error!(error = %e, "id allocator failed to read watermark");
                    return Err(Error::IdGenFailed(e.to_string()));
                }
            };

            let end = base + ID_ALLOC_STEP;
            self.topo
                .put(KEY_ID_GENERATOR, Bytes::from(end.to_string()))
                .await
                .map_err(|e| {
                    error!(error = %e, "id allocator failed to claim window");
                    Error::IdGenFailed(e.to_string())
                })?;

            debug!(base, end, "id allocator claimed window");
            // 0 means "unassigned" everywhere, skip it.
            window.current = if base == 0 { 1 } else { base };
            window.end = end;
        }

        let id = window.current;
        window.current += 1;
        Ok(id)
    }
}

fn decode_watermark(value: &Bytes) -> Result<u64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::IdGenFailed("corrupt watermark".into()))
}
