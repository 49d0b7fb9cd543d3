//! In-memory indexes of partition servers, databases, and spaces.
//!
//! The caches own their records exclusively. Records store only foreign IDs;
//! backward navigation (partition -> space -> db) goes through the owning
//! cache, so there are no cyclic links.

use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::info;

use crate::config::PsPorts;
use crate::error::{Error, Result};
use crate::topo::keys::{db_key, ps_key, space_key};
use crate::topo::TopoStore;
use crate::types::{
    DbId, DbMeta, NodeId, NodeMeta, PartitionId, PsStatus, ReplicaAddrs, SlotId, SpaceId,
    SpaceMeta,
};

use super::partition::Partition;
use super::partition_tree::PartitionTree;

// =============================================================================
// Partition servers
// =============================================================================

struct PsLiveness {
    status: PsStatus,
    last_heartbeat: Instant,
}

/// Master-side record of one partition server.
pub struct PartitionServer {
    node: NodeMeta,
    liveness: Mutex<PsLiveness>,
    /// Partitions known to be assigned to this node, used for register-time
    /// recovery handoff and idle-preferred placement.
    partitions: DashMap<PartitionId, Arc<Partition>>,
}

impl PartitionServer {
    /// Record for a newly registered node; addresses are derived from the
    /// zone-wide PS port layout.
    pub fn new(id: NodeId, ip: &str, ports: &PsPorts) -> Self {
        Self::from_meta(NodeMeta {
            id,
            ip: ip.to_string(),
            addrs: ReplicaAddrs {
                heartbeat: format!("{ip}:{}", ports.heartbeat),
                replicate: format!("{ip}:{}", ports.replicate),
                rpc: format!("{ip}:{}", ports.rpc),
                admin: format!("{ip}:{}", ports.admin),
            },
        })
    }

    pub fn from_meta(node: NodeMeta) -> Self {
        PartitionServer {
            node,
            liveness: Mutex::new(PsLiveness {
                status: PsStatus::Offline,
                last_heartbeat: Instant::now(),
            }),
            partitions: DashMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn ip(&self) -> &str {
        &self.node.ip
    }

    pub fn node(&self) -> &NodeMeta {
        &self.node
    }

    pub fn addrs(&self) -> &ReplicaAddrs {
        &self.node.addrs
    }

    pub fn rpc_addr(&self) -> &str {
        &self.node.addrs.rpc
    }

    pub fn admin_addr(&self) -> &str {
        &self.node.addrs.admin
    }

    pub fn status(&self) -> PsStatus {
        self.liveness.lock().expect("ps liveness poisoned").status
    }

    pub fn change_status(&self, status: PsStatus) {
        self.liveness.lock().expect("ps liveness poisoned").status = status;
    }

    /// Stamp an accepted heartbeat.
    pub fn update_heartbeat(&self) {
        let mut liveness = self.liveness.lock().expect("ps liveness poisoned");
        liveness.last_heartbeat = Instant::now();
        liveness.status = PsStatus::Registered;
    }

    /// Registered and heartbeating within `timeout`.
    pub fn is_alive(&self, timeout: Duration) -> bool {
        let liveness = self.liveness.lock().expect("ps liveness poisoned");
        liveness.status == PsStatus::Registered && liveness.last_heartbeat.elapsed() < timeout
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn add_partition(&self, partition: Arc<Partition>) {
        self.partitions.insert(partition.id(), partition);
    }

    pub fn remove_partition(&self, id: PartitionId) {
        self.partitions.remove(&id);
    }

    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions.iter().map(|e| e.value().clone()).collect()
    }

    /// Persist the node record under `"schema ps <id>"`.
    pub async fn persist(&self, topo: &dyn TopoStore) -> Result<()> {
        let value = serde_json::to_vec(&self.node)
            .map_err(|e| Error::Internal(format!("encode ps node: {e}")))?;
        topo.put(&ps_key(self.node.id), Bytes::from(value)).await?;
        Ok(())
    }
}

/// NodeID -> PS index with an IP sub-index for registration.
#[derive(Default)]
pub struct PsCache {
    servers: DashMap<NodeId, Arc<PartitionServer>>,
    ip_index: DashMap<String, NodeId>,
}

impl PsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&self, server: Arc<PartitionServer>) {
        self.ip_index.insert(server.ip().to_string(), server.id());
        self.servers.insert(server.id(), server);
    }

    pub fn find_server_by_id(&self, id: NodeId) -> Option<Arc<PartitionServer>> {
        self.servers.get(&id).map(|s| s.value().clone())
    }

    pub fn find_server_by_ip(&self, ip: &str) -> Option<Arc<PartitionServer>> {
        let id = *self.ip_index.get(ip)?;
        self.find_server_by_id(id)
    }

    pub fn all_servers(&self) -> Vec<Arc<PartitionServer>> {
        self.servers.iter().map(|s| s.value().clone()).collect()
    }

    /// Servers eligible for replica placement.
    pub fn alive_servers(&self, timeout: Duration) -> Vec<Arc<PartitionServer>> {
        self.servers
            .iter()
            .filter(|s| s.is_alive(timeout))
            .map(|s| s.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

// =============================================================================
// Spaces
// =============================================================================

/// A space and its routing tree.
pub struct Space {
    meta: SpaceMeta,
    tree: RwLock<PartitionTree>,
}

impl Space {
    pub fn new(meta: SpaceMeta) -> Self {
        Space { meta, tree: RwLock::new(PartitionTree::new()) }
    }

    pub fn id(&self) -> SpaceId {
        self.meta.id
    }

    pub fn db(&self) -> DbId {
        self.meta.db
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn meta(&self) -> &SpaceMeta {
        &self.meta
    }

    /// Install or replace a partition in the routing tree.
    pub fn put_partition(&self, partition: Arc<Partition>) {
        self.tree.write().expect("space tree poisoned").update(partition);
    }

    pub fn remove_partition(&self, partition: &Partition) {
        self.tree.write().expect("space tree poisoned").remove(partition);
    }

    pub fn search(&self, slot: SlotId) -> Option<Arc<Partition>> {
        self.tree.read().expect("space tree poisoned").search(slot)
    }

    pub fn multiple_search(&self, slot: SlotId, num: usize) -> Vec<Arc<Partition>> {
        self.tree
            .read()
            .expect("space tree poisoned")
            .multiple_search(slot, num)
    }

    pub fn partition_count(&self) -> usize {
        self.tree.read().expect("space tree poisoned").len()
    }

    pub async fn persist(&self, topo: &dyn TopoStore) -> Result<()> {
        let value = serde_json::to_vec(&self.meta)
            .map_err(|e| Error::Internal(format!("encode space: {e}")))?;
        topo.put(&space_key(self.meta.id), Bytes::from(value)).await?;
        Ok(())
    }
}

/// SpaceID -> space index with a name sub-index, owned by a database.
#[derive(Default)]
pub struct SpaceCache {
    spaces: DashMap<SpaceId, Arc<Space>>,
    name_index: DashMap<String, SpaceId>,
}

impl SpaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_space(&self, space: Arc<Space>) {
        self.name_index.insert(space.name().to_string(), space.id());
        self.spaces.insert(space.id(), space);
    }

    pub fn find_space_by_id(&self, id: SpaceId) -> Option<Arc<Space>> {
        self.spaces.get(&id).map(|s| s.value().clone())
    }

    pub fn find_space_by_name(&self, name: &str) -> Option<Arc<Space>> {
        let id = *self.name_index.get(name)?;
        self.find_space_by_id(id)
    }

    pub fn all_spaces(&self) -> Vec<Arc<Space>> {
        self.spaces.iter().map(|s| s.value().clone()).collect()
    }
}

// =============================================================================
// Databases
// =============================================================================

/// A database and its spaces.
pub struct Db {
    meta: DbMeta,
    space_cache: SpaceCache,
}

impl Db {
    pub fn new(meta: DbMeta) -> Self {
        Db { meta, space_cache: SpaceCache::new() }
    }

    pub fn id(&self) -> DbId {
        self.meta.id
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn meta(&self) -> &DbMeta {
        &self.meta
    }

    pub fn spaces(&self) -> &SpaceCache {
        &self.space_cache
    }

    pub async fn persist(&self, topo: &dyn TopoStore) -> Result<()> {
        let value = serde_json::to_vec(&self.meta)
            .map_err(|e| Error::Internal(format!("encode db: {e}")))?;
        topo.put(&db_key(self.meta.id), Bytes::from(value)).await?;
        Ok(())
    }
}

/// DBID -> database index with a name sub-index.
#[derive(Default)]
pub struct DbCache {
    dbs: DashMap<DbId, Arc<Db>>,
    name_index: DashMap<String, DbId>,
}

impl DbCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_db(&self, db: Arc<Db>) {
        info!(db = %db.id(), name = db.name(), "db added to cache");
        self.name_index.insert(db.name().to_string(), db.id());
        self.dbs.insert(db.id(), db);
    }

    pub fn find_db_by_id(&self, id: DbId) -> Option<Arc<Db>> {
        self.dbs.get(&id).map(|d| d.value().clone())
    }

    pub fn find_db_by_name(&self, name: &str) -> Option<Arc<Db>> {
        let id = *self.name_index.get(name)?;
        self.find_db_by_id(id)
    }

    pub fn all_dbs(&self) -> Vec<Arc<Db>> {
        self.dbs.iter().map(|d| d.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionMeta;

    fn ports() -> PsPorts {
        PsPorts::default()
    }

    #[test]
    fn ps_addrs_derived_from_ports() {
        let ps = PartitionServer::new(NodeId(1), "10.0.0.5", &ports());
        assert_eq!(ps.addrs().rpc, "10.0.0.5:8813");
        assert_eq!(ps.addrs().admin, "10.0.0.5:8814");
        assert_eq!(ps.rpc_addr(), "10.0.0.5:8813");
    }

    #[test]
    fn ps_liveness_follows_heartbeats() {
        let ps = PartitionServer::new(NodeId(1), "10.0.0.5", &ports());
        assert_eq!(ps.status(), PsStatus::Offline);
        assert!(!ps.is_alive(Duration::from_secs(60)));

        ps.update_heartbeat();
        assert_eq!(ps.status(), PsStatus::Registered);
        assert!(ps.is_alive(Duration::from_secs(60)));
        // A zero timeout makes any heartbeat stale.
        assert!(!ps.is_alive(Duration::ZERO));
    }

    #[test]
    fn ps_cache_indexes_by_id_and_ip() {
        let cache = PsCache::new();
        cache.add_server(Arc::new(PartitionServer::new(NodeId(1), "10.0.0.5", &ports())));
        cache.add_server(Arc::new(PartitionServer::new(NodeId(2), "10.0.0.6", &ports())));

        assert_eq!(cache.find_server_by_id(NodeId(2)).unwrap().ip(), "10.0.0.6");
        assert_eq!(cache.find_server_by_ip("10.0.0.5").unwrap().id(), NodeId(1));
        assert!(cache.find_server_by_id(NodeId(9)).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn alive_servers_filters_by_heartbeat() {
        let cache = PsCache::new();
        let alive = Arc::new(PartitionServer::new(NodeId(1), "10.0.0.5", &ports()));
        alive.update_heartbeat();
        cache.add_server(alive);
        cache.add_server(Arc::new(PartitionServer::new(NodeId(2), "10.0.0.6", &ports())));

        let found = cache.alive_servers(Duration::from_secs(60));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), NodeId(1));
    }

    #[test]
    fn space_cache_lookup() {
        let db = Db::new(DbMeta { id: DbId(1), name: "library".into() });
        db.spaces().add_space(Arc::new(Space::new(SpaceMeta {
            id: SpaceId(3),
            db: DbId(1),
            name: "books".into(),
            partition_num: 4,
        })));

        assert_eq!(db.spaces().find_space_by_name("books").unwrap().id(), SpaceId(3));
        assert!(db.spaces().find_space_by_name("missing").is_none());
    }

    #[test]
    fn db_cache_lookup() {
        let cache = DbCache::new();
        cache.add_db(Arc::new(Db::new(DbMeta { id: DbId(1), name: "library".into() })));

        assert_eq!(cache.find_db_by_name("library").unwrap().id(), DbId(1));
        assert_eq!(cache.find_db_by_id(DbId(1)).unwrap().name(), "library");
        assert!(cache.find_db_by_name("missing").is_none());
    }

    #[test]
    fn space_routes_through_tree() {
        let space = Space::new(SpaceMeta {
            id: SpaceId(1),
            db: DbId(1),
            name: "books".into(),
            partition_num: 1,
        });
        space.put_partition(Arc::new(Partition::from_meta(PartitionMeta {
            id: PartitionId(10),
            start_slot: SlotId(0),
            end_slot: SlotId(100),
            ..Default::default()
        })));

        assert_eq!(space.search(SlotId(50)).unwrap().id(), PartitionId(10));
        assert!(space.search(SlotId(100)).is_none());
        assert_eq!(space.partition_count(), 1);
    }
}
