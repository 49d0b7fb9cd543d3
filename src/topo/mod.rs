//! Topology store abstraction.
//!
//! The zone master persists all cluster metadata — databases, spaces,
//! partitions, PS nodes, the ID-allocator watermark — in an external
//! watchable hierarchical KV store (etcd-like). This module defines the
//! consumed surface: versioned `get`/`put`/`delete`, prefix scans, and watch
//! streams. The store itself is an external collaborator; the in-memory
//! implementation in [`mem`] backs tests and single-node deployments.
//!
//! # Watch streams
//!
//! A watch yields a lazy, cancellable sequence of [`WatchData`] items. The
//! stream terminates with a distinguished [`TopoError::NoNode`] item when the
//! watched node is deleted, or with [`TopoError::Interrupted`] on
//! cancellation. Directory watches relay deletions as `NoNode`-tagged items
//! carrying the trimmed key and keep streaming.

pub mod keys;
#[cfg(any(test, feature = "test-utilities"))]
pub mod mem;

mod id_allocator;

pub use id_allocator::IdAllocator;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error as ThisError;
use tokio::sync::{broadcast, mpsc};

pub type TopoResult<T> = std::result::Result<T, TopoError>;

/// Modification revision of a topology node.
pub type Version = u64;

/// Topology store errors.
#[derive(Debug, Clone, ThisError)]
pub enum TopoError {
    /// The addressed node does not exist. Also used as the distinguished
    /// terminator of watch streams.
    #[error("topology node does not exist")]
    NoNode,

    /// A compare-and-set raced with a concurrent writer.
    #[error("topology node version mismatch")]
    BadVersion,

    /// The watch was cancelled before the node was deleted.
    #[error("watch interrupted")]
    Interrupted,

    #[error("topology store: {0}")]
    Storage(String),
}

/// One item of a watch stream.
///
/// `err` is `None` for ordinary updates. A directory watch reports a deleted
/// child with `err = Some(NoNode)` and the trimmed child key in `contents`.
#[derive(Debug, Clone)]
pub struct WatchData {
    pub contents: Bytes,
    pub version: Version,
    pub err: Option<TopoError>,
}

impl WatchData {
    pub fn update(contents: Bytes, version: Version) -> Self {
        WatchData { contents, version, err: None }
    }

    pub fn error(err: TopoError) -> Self {
        WatchData { contents: Bytes::new(), version: 0, err: Some(err) }
    }
}

/// Cancellation handle of a watch stream.
///
/// Dropping the handle without calling [`cancel`](WatchCancel::cancel) leaves
/// the watch running for the lifetime of the receiver.
#[derive(Debug)]
pub struct WatchCancel(broadcast::Sender<()>);

impl WatchCancel {
    pub fn new(tx: broadcast::Sender<()>) -> Self {
        WatchCancel(tx)
    }

    /// Stop the watch; the stream terminates with
    /// [`TopoError::Interrupted`].
    pub fn cancel(self) {
        let _ = self.0.send(());
    }
}

/// The consumed topology-store surface.
#[async_trait]
pub trait TopoStore: Send + Sync {
    /// Read a node's value and version.
    async fn get(&self, path: &str) -> TopoResult<(Bytes, Version)>;

    /// Write a node, creating it if absent. Returns the new version.
    async fn put(&self, path: &str, value: Bytes) -> TopoResult<Version>;

    /// Delete a node. Deleting a missing node is a no-op.
    async fn delete(&self, path: &str) -> TopoResult<()>;

    /// List every node under `prefix` (using the
    /// [`keys::bytes_prefix`] upper bound), in key order.
    async fn scan(&self, prefix: &str) -> TopoResult<Vec<(String, Bytes)>>;

    /// Watch a single node. Returns the current value followed by a stream
    /// of updates.
    async fn watch(
        &self,
        path: &str,
    ) -> TopoResult<(WatchData, mpsc::Receiver<WatchData>, WatchCancel)>;

    /// Watch every node under `prefix`, starting after `version` when given.
    async fn watch_dir(
        &self,
        prefix: &str,
        version: Option<Version>,
    ) -> TopoResult<(mpsc::Receiver<WatchData>, WatchCancel)>;
}
