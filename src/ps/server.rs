//! Partition-server lifecycle.
//!
//! Boot sequence: load the persisted identity, register with the master
//! (`node_id == 0` requests a fresh identity), diff locally persisted
//! partitions against the master's assignment, delete the extraneous,
//! recover the assigned in parallel, then start the admin worker and the
//! heartbeat loop with an immediate trigger.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use backon::{ExponentialBuilder, Retryable};
use tokio::sync::{broadcast, mpsc, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::config::PsConfig;
use crate::constants::{ADMIN_CHANNEL_LIMIT, REGISTER_MAX_RETRIES, REGISTER_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::{
    PartitionInfo, PsHeartbeatRequest, PsRegisterRequest, RequestHeader, RuntimeInfo,
};
use crate::error::RespCode;
use crate::rpc::MasterClient;
use crate::types::{NodeId, PartitionId, PartitionMeta};

use super::admin::{spawn_admin_loop, AdminEvent};
use super::consensus::{ConsensusModule, RaftResolver};
use super::heartbeat::spawn_heartbeat_loop;
use super::meta::{MetaInfo, ServerMeta};
use super::store::PartitionStore;

/// One partition server.
pub struct PsServer {
    config: PsConfig,
    node_id: AtomicU64,
    meta: ServerMeta,
    resolver: Arc<RaftResolver>,
    consensus: Arc<dyn ConsensusModule>,
    master: Option<Arc<dyn MasterClient>>,
    /// Leader hint learned from `MASTER_NOT_LEADER` responses.
    master_leader: RwLock<Option<String>>,
    partitions: dashmap::DashMap<PartitionId, Arc<PartitionStore>>,
    admin_tx: mpsc::Sender<AdminEvent>,
    admin_rx: Mutex<Option<mpsc::Receiver<AdminEvent>>>,
    heartbeat_trigger: Notify,
    shutdown_tx: broadcast::Sender<()>,
    stopping: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PsServer {
    /// Build a server. `master = None` runs standalone (no registration, no
    /// heartbeats), which the admin-surface tests use.
    pub fn new(
        config: PsConfig,
        consensus: Arc<dyn ConsensusModule>,
        master: Option<Arc<dyn MasterClient>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let meta = ServerMeta::new(&config.store_path)?;
        let (admin_tx, admin_rx) = mpsc::channel(ADMIN_CHANNEL_LIMIT);
        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Arc::new(PsServer {
            config,
            node_id: AtomicU64::new(0),
            meta,
            resolver: Arc::new(RaftResolver::new()),
            consensus,
            master,
            master_leader: RwLock::new(None),
            partitions: dashmap::DashMap::new(),
            admin_tx,
            admin_rx: Mutex::new(Some(admin_rx)),
            heartbeat_trigger: Notify::new(),
            shutdown_tx,
            stopping: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &PsConfig {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_id.load(Ordering::Acquire))
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn hosted_partitions(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.partitions.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub(super) fn find_store(&self, id: PartitionId) -> Option<Arc<PartitionStore>> {
        self.partitions.get(&id).map(|s| s.value().clone())
    }

    pub(super) fn publish_store(&self, store: Arc<PartitionStore>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.partitions.entry(store.id()) {
            Entry::Occupied(_) => Err(Error::Internal("partition already hosted".into())),
            Entry::Vacant(entry) => {
                entry.insert(store);
                Ok(())
            }
        }
    }

    pub(super) fn unpublish_store(&self, id: PartitionId) -> Option<Arc<PartitionStore>> {
        self.partitions.remove(&id).map(|(_, s)| s)
    }

    pub(super) fn admin_tx(&self) -> &mpsc::Sender<AdminEvent> {
        &self.admin_tx
    }

    pub(super) fn server_meta(&self) -> &ServerMeta {
        &self.meta
    }

    pub(super) fn consensus(&self) -> Arc<dyn ConsensusModule> {
        self.consensus.clone()
    }

    pub(super) fn resolver(&self) -> Arc<RaftResolver> {
        self.resolver.clone()
    }

    pub(super) fn trigger_heartbeat(&self) {
        self.heartbeat_trigger.notify_one();
    }

    pub(super) async fn heartbeat_triggered(&self) {
        self.heartbeat_trigger.notified().await;
    }

    // ========================================================================
    // Boot
    // ========================================================================

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.stopping.store(false, Ordering::Release);

        // Load the persisted identity; a cluster move invalidates all local
        // partition state.
        let info = self.meta.get_info();
        info!(node = %info.node_id, cluster = info.cluster_id, "ps loaded local meta");
        if info.node_id.is_assigned() {
            self.node_id.store(info.node_id.value(), Ordering::Release);
        }
        if !info.cluster_id.is_empty() && info.cluster_id != self.config.cluster_id {
            warn!(
                persisted = info.cluster_id,
                configured = self.config.cluster_id,
                "cluster id changed, clearing local partitions"
            );
            self.meta.clear_all();
        }

        let mut assigned: Vec<PartitionMeta> = Vec::new();
        if self.master.is_some() {
            let resp = self.register().await?;
            self.node_id.store(resp.node_id.value(), Ordering::Release);
            self.meta.reset_info(&MetaInfo {
                cluster_id: self.config.cluster_id.clone(),
                node_id: resp.node_id,
            })?;
            info!(node = %resp.node_id, partitions = resp.partitions.len(), "ps registered with master");
            assigned = resp.partitions;
        }

        // Diff local partitions against the assignment.
        if assigned.is_empty() {
            self.meta.clear_all();
        } else {
            self.destroy_exclude_partition(&assigned);
        }
        self.recover_partitions(assigned).await;

        // Workers.
        let admin_rx = self
            .admin_rx
            .lock()
            .expect("ps admin rx poisoned")
            .take()
            .ok_or_else(|| Error::Internal("ps server already started".into()))?;
        let mut tasks = self.tasks.lock().expect("ps tasks poisoned");
        tasks.push(spawn_admin_loop(self.clone(), admin_rx, self.shutdown_tx.subscribe()));
        if self.master.is_some() {
            tasks.push(spawn_heartbeat_loop(self.clone(), self.shutdown_tx.subscribe()));
            self.trigger_heartbeat();
        }

        info!(node = %self.node_id(), "partition server started");
        Ok(())
    }

    async fn register(&self) -> Result<crate::protocol::PsRegisterResponse> {
        let master = self.master.as_ref().ok_or(Error::Internal("no master client".into()))?;

        let register_once = || async {
            let addr = self.master_addr();
            let req = PsRegisterRequest {
                header: RequestHeader::new(),
                node_id: self.node_id(),
                ip: self.config.ip.clone(),
                runtime: runtime_info(),
            };

            let resp = tokio::time::timeout(REGISTER_TIMEOUT, master.ps_register(&addr, req))
                .await
                .map_err(|_| Error::Rpc(format!("register to {addr} timed out")))??;

            if resp.header.is_ok() {
                return Ok(resp);
            }

            // Learn the leader for the next attempt.
            if let Some(not_leader) = &resp.header.error.not_leader {
                self.set_master_leader(Some(not_leader.leader_addr.clone()));
            } else if resp.header.error.no_leader {
                self.set_master_leader(None);
            }
            if resp.header.code == RespCode::PsNotExists {
                // The master never issued this identity; retrying cannot
                // succeed.
                return Err(Error::PsNotExists);
            }
            Err(Error::Rpc(format!(
                "register rejected with {:?}: {}",
                resp.header.code, resp.header.message
            )))
        };

        register_once
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(100))
                    .with_max_delay(Duration::from_secs(5))
                    .with_max_times(REGISTER_MAX_RETRIES)
                    .with_jitter(),
            )
            .when(|e: &Error| !matches!(e, Error::PsNotExists))
            .await
    }

    fn destroy_exclude_partition(&self, assigned: &[PartitionMeta]) {
        for id in self.meta.get_all_partitions() {
            if !assigned.iter().any(|p| p.id == id) {
                info!(partition = %id, "dropping partition not in master assignment");
                self.meta.clear(id);
            }
        }
    }

    /// Recover assigned partitions in parallel, bounded by the configured
    /// concurrency.
    async fn recover_partitions(self: &Arc<Self>, mut assigned: Vec<PartitionMeta>) {
        assigned.sort_by_key(|p| p.id);

        let semaphore = Arc::new(Semaphore::new(self.config.recover_concurrency));
        let mut tasks = JoinSet::new();
        for meta in assigned {
            let server = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                info!(partition = %meta.id, "recovering partition");
                server.do_partition_create(meta).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    fn master_addr(&self) -> String {
        self.master_leader
            .read()
            .expect("ps master leader poisoned")
            .clone()
            .unwrap_or_else(|| self.config.master_addr.clone())
    }

    fn set_master_leader(&self, addr: Option<String>) {
        *self.master_leader.write().expect("ps master leader poisoned") = addr;
    }

    pub(super) fn heartbeat_request(&self) -> PsHeartbeatRequest {
        let partitions: Vec<PartitionInfo> = self
            .partitions
            .iter()
            .map(|entry| entry.value().partition_info())
            .collect();

        PsHeartbeatRequest {
            header: RequestHeader::new(),
            node_id: self.node_id(),
            partitions,
        }
    }

    /// Send one heartbeat, re-targeting on leadership hints.
    pub(super) async fn send_heartbeat(&self) {
        let Some(master) = self.master.as_ref() else { return };
        if self.is_stopping() {
            return;
        }

        let addr = self.master_addr();
        let req = self.heartbeat_request();
        match master.ps_heartbeat(&addr, req).await {
            Ok(resp) if resp.header.is_ok() => {}
            Ok(resp) => {
                if let Some(not_leader) = &resp.header.error.not_leader {
                    self.set_master_leader(Some(not_leader.leader_addr.clone()));
                } else if resp.header.error.no_leader {
                    self.set_master_leader(None);
                }
                if resp.header.code == RespCode::PsNotExists {
                    warn!(node = %self.node_id(), "master does not know this node, re-registration required");
                }
                warn!(code = ?resp.header.code, "heartbeat rejected by master");
            }
            Err(e) => {
                error!(error = %e, "heartbeat rpc failed");
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop workers, close every hosted partition, and drop transport
    /// registrations. Local partition meta is kept for the next boot's diff.
    pub async fn close(&self) {
        self.stopping.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.tasks.lock().expect("ps tasks poisoned").drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let ids: Vec<_> = self.partitions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, store)) = self.partitions.remove(&id) {
                let meta = store.meta();
                store.close().await;
                for replica in &meta.replicas {
                    self.resolver.delete_node(replica.node_id);
                }
            }
        }

        info!(node = %self.node_id(), "partition server closed");
    }
}

fn runtime_info() -> RuntimeInfo {
    RuntimeInfo {
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        start_time: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().to_string())
            .unwrap_or_default(),
    }
}
