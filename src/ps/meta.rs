//! Local metadata persistence on a partition server.
//!
//! A PS keeps its identity (cluster id + node id) and the meta of every
//! partition it hosts under its store path:
//!
//! ```text
//! <store_path>/meta.json            node identity
//! <store_path>/partitions/<id>.json per-partition meta
//! ```
//!
//! At boot the node diffs these files against the master's assignment and
//! destroys anything the master no longer hands it.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::types::{NodeId, PartitionId, PartitionMeta};

/// Persisted node identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub cluster_id: String,
    pub node_id: NodeId,
}

/// Filesystem-backed PS metadata.
pub struct ServerMeta {
    base: PathBuf,
}

impl ServerMeta {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(base.join("partitions"))
            .map_err(|e| Error::LocalDbOps(format!("create meta dir: {e}")))?;
        Ok(ServerMeta { base })
    }

    fn info_path(&self) -> PathBuf {
        self.base.join("meta.json")
    }

    fn partition_path(&self, id: PartitionId) -> PathBuf {
        self.base.join("partitions").join(format!("{id}.json"))
    }

    /// Load the node identity; a missing or unreadable file yields the
    /// default (never-registered) identity.
    pub fn get_info(&self) -> MetaInfo {
        match fs::read(self.info_path()) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "corrupt meta file, starting with a fresh identity");
                MetaInfo::default()
            }),
            Err(_) => MetaInfo::default(),
        }
    }

    /// Replace the node identity.
    pub fn reset_info(&self, info: &MetaInfo) -> Result<()> {
        let raw = serde_json::to_vec_pretty(info)
            .map_err(|e| Error::LocalDbOps(format!("encode meta: {e}")))?;
        fs::write(self.info_path(), raw)
            .map_err(|e| Error::LocalDbOps(format!("write meta: {e}")))
    }

    /// Persist one partition's meta.
    pub fn save_partition(&self, meta: &PartitionMeta) -> Result<()> {
        let raw = serde_json::to_vec_pretty(meta)
            .map_err(|e| Error::LocalDbOps(format!("encode partition meta: {e}")))?;
        fs::write(self.partition_path(meta.id), raw)
            .map_err(|e| Error::LocalDbOps(format!("write partition meta: {e}")))
    }

    /// Load one partition's meta.
    pub fn load_partition(&self, id: PartitionId) -> Result<PartitionMeta> {
        let raw = fs::read(self.partition_path(id))
            .map_err(|e| Error::LocalDbOps(format!("read partition meta: {e}")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::LocalDbOps(format!("decode partition meta: {e}")))
    }

    /// IDs of every locally persisted partition.
    pub fn get_all_partitions(&self) -> Vec<PartitionId> {
        let dir = match fs::read_dir(self.base.join("partitions")) {
            Ok(dir) => dir,
            Err(e) => {
                error!(error = %e, "failed to list partition meta dir");
                return Vec::new();
            }
        };

        let mut ids = Vec::new();
        for entry in dir.flatten() {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(raw) = stem.parse() {
                ids.push(PartitionId(raw));
            }
        }
        ids.sort();
        ids
    }

    /// Drop one partition's persisted meta.
    pub fn clear(&self, id: PartitionId) {
        if let Err(e) = fs::remove_file(self.partition_path(id)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(partition = %id, error = %e, "failed to clear partition meta");
            }
        }
    }

    /// Drop every persisted partition meta, keeping the node identity.
    pub fn clear_all(&self) {
        for id in self.get_all_partitions() {
            self.clear(id);
        }
    }
}
