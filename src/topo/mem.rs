//! In-memory watchable topology store.
//!
//! A full-featured implementation of [`TopoStore`] with no external
//! dependencies, used by the integration tests and by single-node
//! deployments. Revisions are global and monotonic, so versions behave like
//! an etcd `ModRevision`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use super::keys::bytes_prefix;
use super::{TopoError, TopoResult, TopoStore, Version, WatchCancel, WatchData};

const WATCH_CHANNEL_CAPACITY: usize = 10;

struct Watcher {
    /// Key (exact watch) or key prefix (directory watch).
    target: String,
    is_dir: bool,
    tx: mpsc::Sender<WatchData>,
    cancel_rx: broadcast::Receiver<()>,
}

impl Watcher {
    fn matches(&self, key: &str) -> bool {
        if self.is_dir {
            key.starts_with(&self.target)
        } else {
            key == self.target
        }
    }

    fn cancelled(&mut self) -> bool {
        // A dropped (never-fired) cancel handle leaves the watch running.
        matches!(
            self.cancel_rx.try_recv(),
            Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_))
        )
    }
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, (Bytes, Version)>,
    revision: Version,
    watchers: Vec<Watcher>,
}

/// In-memory [`TopoStore`].
#[derive(Default)]
pub struct MemTopoStore {
    inner: Mutex<Inner>,
}

impl MemTopoStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(inner: &mut Inner, key: &str, data: WatchData, deleted: bool) {
        inner.watchers.retain_mut(|w| {
            if w.cancelled() {
                let _ = w.tx.try_send(WatchData::error(TopoError::Interrupted));
                return false;
            }
            if !w.matches(key) {
                return true;
            }

            if deleted {
                if w.is_dir {
                    // Relay the trimmed child key; the dir watch keeps going.
                    let trimmed = key.strip_prefix(&w.target).unwrap_or(key);
                    let mut item = WatchData::error(TopoError::NoNode);
                    item.contents = Bytes::copy_from_slice(trimmed.as_bytes());
                    item.version = data.version;
                    let _ = w.tx.try_send(item);
                    true
                } else {
                    // Final notification; the exact watch ends here.
                    let _ = w.tx.try_send(WatchData::error(TopoError::NoNode));
                    false
                }
            } else {
                let _ = w.tx.try_send(data.clone());
                true
            }
        });
    }
}

#[async_trait]
impl TopoStore for MemTopoStore {
    async fn get(&self, path: &str) -> TopoResult<(Bytes, Version)> {
        let inner = self.inner.lock().expect("topo store poisoned");
        inner.nodes.get(path).cloned().ok_or(TopoError::NoNode)
    }

    async fn put(&self, path: &str, value: Bytes) -> TopoResult<Version> {
        let mut inner = self.inner.lock().expect("topo store poisoned");
        inner.revision += 1;
        let version = inner.revision;
        inner.nodes.insert(path.to_string(), (value.clone(), version));
        Self::notify(&mut inner, path, WatchData::update(value, version), false);
        Ok(version)
    }

    async fn delete(&self, path: &str) -> TopoResult<()> {
        let mut inner = self.inner.lock().expect("topo store poisoned");
        if inner.nodes.remove(path).is_some() {
            inner.revision += 1;
            let version = inner.revision;
            Self::notify(&mut inner, path, WatchData::update(Bytes::new(), version), true);
        }
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> TopoResult<Vec<(String, Bytes)>> {
        let inner = self.inner.lock().expect("topo store poisoned");
        let result = match bytes_prefix(prefix.as_bytes()) {
            Some(limit) => {
                let limit = String::from_utf8_lossy(&limit).into_owned();
                inner
                    .nodes
                    .range(prefix.to_string()..limit)
                    .map(|(k, (v, _))| (k.clone(), v.clone()))
                    .collect()
            }
            None => inner
                .nodes
                .range(prefix.to_string()..)
                .map(|(k, (v, _))| (k.clone(), v.clone()))
                .collect(),
        };
        Ok(result)
    }

    async fn watch(
        &self,
        path: &str,
    ) -> TopoResult<(WatchData, mpsc::Receiver<WatchData>, WatchCancel)> {
        let mut inner = self.inner.lock().expect("topo store poisoned");
        let (value, version) = inner.nodes.get(path).cloned().ok_or(TopoError::NoNode)?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        inner.watchers.push(Watcher {
            target: path.to_string(),
            is_dir: false,
            tx,
            cancel_rx,
        });

        Ok((WatchData::update(value, version), rx, WatchCancel::new(cancel_tx)))
    }

    async fn watch_dir(
        &self,
        prefix: &str,
        _version: Option<Version>,
    ) -> TopoResult<(mpsc::Receiver<WatchData>, WatchCancel)> {
        let mut inner = self.inner.lock().expect("topo store poisoned");
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        inner.watchers.push(Watcher {
            target: prefix.to_string(),
            is_dir: true,
            tx,
            cancel_rx,
        });
        Ok((rx, WatchCancel::new(cancel_tx)))
    }
}
