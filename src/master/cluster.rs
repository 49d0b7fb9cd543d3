//! The zone-master control-plane context.
//!
//! [`ControlPlane`] carries everything a master-side component needs: the
//! configuration, the topology store, the ID allocator, the metadata caches,
//! and the leadership state. It is built once in `main` and threaded through
//! by shared-ownership handle; there are no process-wide singletons.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::config::MasterConfig;
use crate::error::{Error, Result};
use crate::topo::{IdAllocator, TopoStore};
use crate::types::{slot_split, DbId, DbMeta, NodeMeta, SlotId, SpaceId, SpaceMeta};

use super::cache::{Db, DbCache, PartitionServer, PsCache, Space};
use super::partition::{Partition, PartitionCache};

struct Leadership {
    is_leader: AtomicBool,
    leader_addr: RwLock<Option<String>>,
}

/// Shared zone-master state.
pub struct ControlPlane {
    pub config: MasterConfig,
    pub topo: Arc<dyn TopoStore>,
    pub ids: IdAllocator,
    pub ps_cache: PsCache,
    pub db_cache: DbCache,
    pub partition_cache: PartitionCache,
    leadership: Leadership,
}

impl ControlPlane {
    pub fn new(config: MasterConfig, topo: Arc<dyn TopoStore>) -> Arc<Self> {
        Arc::new(ControlPlane {
            ids: IdAllocator::new(topo.clone()),
            topo,
            config,
            ps_cache: PsCache::new(),
            db_cache: DbCache::new(),
            partition_cache: PartitionCache::new(),
            leadership: Leadership {
                is_leader: AtomicBool::new(false),
                leader_addr: RwLock::new(None),
            },
        })
    }

    // ========================================================================
    // Leadership
    // ========================================================================

    /// Whether this master is the cluster-metadata leader. Every mutating
    /// RPC checks this at entry.
    pub fn mine_is_leader(&self) -> bool {
        self.leadership.is_leader.load(Ordering::Acquire)
    }

    /// The current leader address, when known and not us.
    pub fn leader_hint(&self) -> Option<String> {
        self.leadership
            .leader_addr
            .read()
            .expect("leadership poisoned")
            .clone()
    }

    pub fn become_leader(&self) {
        info!(addr = %self.config.node_addr, "zone master became leader");
        *self
            .leadership
            .leader_addr
            .write()
            .expect("leadership poisoned") = Some(self.config.node_addr.clone());
        self.leadership.is_leader.store(true, Ordering::Release);
    }

    pub fn step_down(&self, leader_addr: Option<String>) {
        info!(new_leader = ?leader_addr, "zone master stepped down");
        self.leadership.is_leader.store(false, Ordering::Release);
        *self
            .leadership
            .leader_addr
            .write()
            .expect("leadership poisoned") = leader_addr;
    }

    /// The error non-leaders answer mutating RPCs with.
    pub fn not_leader_error(&self) -> Error {
        match self.leader_hint() {
            Some(addr) if addr != self.config.node_addr => Error::MasterNotLeader(Some(addr)),
            _ => Error::MasterNotLeader(None),
        }
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Create and persist a database.
    pub async fn create_db(&self, name: &str) -> Result<Arc<Db>> {
        if self.db_cache.find_db_by_name(name).is_some() {
            return Err(Error::Internal(format!("db {name} already exists")));
        }

        let id = DbId(self.ids.next().await?);
        let db = Arc::new(Db::new(DbMeta { id, name: name.to_string() }));
        db.persist(self.topo.as_ref()).await?;
        self.db_cache.add_db(db.clone());
        Ok(db)
    }

    /// Create a space with `partition_num` partitions covering the full slot
    /// domain. Each partition is persisted `Readonly` with zero replicas;
    /// replicas arrive through heartbeat reconciliation.
    pub async fn create_space(
        &self,
        db_id: DbId,
        name: &str,
        partition_num: u32,
    ) -> Result<Arc<Space>> {
        let db = self.db_cache.find_db_by_id(db_id).ok_or(Error::DbNotExists)?;
        if db.spaces().find_space_by_name(name).is_some() {
            return Err(Error::Internal(format!("space {name} already exists")));
        }

        let bounds = slot_split(0, u32::MAX, u64::from(partition_num) + 1)
            .ok_or_else(|| Error::Internal("cannot split slot domain".into()))?;

        let id = SpaceId(self.ids.next().await?);
        let space = Arc::new(Space::new(SpaceMeta {
            id,
            db: db_id,
            name: name.to_string(),
            partition_num,
        }));
        space.persist(self.topo.as_ref()).await?;

        for window in bounds.windows(2) {
            let partition = Arc::new(
                Partition::create(&self.ids, db_id, id, SlotId(window[0]), SlotId(window[1]))
                    .await?,
            );
            partition.persist(self.topo.as_ref()).await?;
            self.partition_cache.add_partition(partition.clone());
            space.put_partition(partition);
        }

        db.spaces().add_space(space.clone());
        info!(db = %db_id, space = %id, partitions = partition_num, "space created");
        Ok(space)
    }

    /// Resolve a space by database and space ID.
    pub fn find_space(&self, db: DbId, space: SpaceId) -> Result<Arc<Space>> {
        let db = self.db_cache.find_db_by_id(db).ok_or(Error::DbNotExists)?;
        db.spaces()
            .find_space_by_id(space)
            .ok_or(Error::SpaceNotExists)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Rebuild the ps, db, space, and partition caches (and every space
    /// tree) from the topology store. Recovered PS records start `Offline`
    /// until their next heartbeat. Idempotent: re-running yields the same
    /// state.
    pub async fn recover(&self) -> Result<()> {
        for (_, value) in self.topo.scan(crate::constants::PREFIX_PS).await? {
            let meta: NodeMeta = serde_json::from_slice(&value)
                .map_err(|e| Error::Internal(format!("decode ps node: {e}")))?;
            self.ps_cache
                .add_server(Arc::new(PartitionServer::from_meta(meta)));
        }

        for (_, value) in self.topo.scan(crate::constants::PREFIX_DB).await? {
            let meta: DbMeta = serde_json::from_slice(&value)
                .map_err(|e| Error::Internal(format!("decode db: {e}")))?;
            self.db_cache.add_db(Arc::new(Db::new(meta)));
        }

        for (_, value) in self.topo.scan(crate::constants::PREFIX_SPACE).await? {
            let meta: SpaceMeta = serde_json::from_slice(&value)
                .map_err(|e| Error::Internal(format!("decode space: {e}")))?;
            let db = self.db_cache.find_db_by_id(meta.db).ok_or(Error::DbNotExists)?;
            db.spaces().add_space(Arc::new(Space::new(meta)));
        }

        let partitions = PartitionCache::recover(self.topo.as_ref()).await?;
        let count = partitions.len();
        for partition in partitions {
            self.partition_cache.add_partition(partition.clone());
            if let Ok(space) = self.find_space(partition.db(), partition.space()) {
                space.put_partition(partition.clone());
            }
            for replica in partition.meta().await.replicas {
                if let Some(ps) = self.ps_cache.find_server_by_id(replica.node_id) {
                    ps.add_partition(partition.clone());
                }
            }
        }

        info!(partitions = count, "control plane recovered from topology store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topo::mem::MemTopoStore;

    fn control_plane() -> Arc<ControlPlane> {
        ControlPlane::new(MasterConfig::default(), Arc::new(MemTopoStore::new()))
    }

    #[tokio::test]
    async fn leadership_transitions() {
        let cluster = control_plane();
        assert!(!cluster.mine_is_leader());
        assert!(matches!(cluster.not_leader_error(), Error::MasterNotLeader(None)));

        cluster.become_leader();
        assert!(cluster.mine_is_leader());

        cluster.step_down(Some("10.0.0.9:8817".into()));
        assert!(!cluster.mine_is_leader());
        match cluster.not_leader_error() {
            Error::MasterNotLeader(Some(addr)) => assert_eq!(addr, "10.0.0.9:8817"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_space_covers_slot_domain() {
        let cluster = control_plane();
        let db = cluster.create_db("library").await.unwrap();
        let space = cluster.create_space(db.id(), "books", 4).await.unwrap();

        assert_eq!(space.partition_count(), 4);
        assert_eq!(cluster.partition_cache.len(), 4);

        // Boundary slots route.
        assert!(space.search(SlotId(0)).is_some());
        assert!(space.search(SlotId(u32::MAX)).is_some());

        // Every partition starts where the previous ended.
        let routes = space.multiple_search(SlotId(0), 10);
        assert_eq!(routes.len(), 4);
        for pair in routes.windows(2) {
            assert_eq!(pair[0].end_slot(), pair[1].start_slot());
        }
    }

    #[tokio::test]
    async fn create_space_requires_db() {
        let cluster = control_plane();
        assert!(matches!(
            cluster.create_space(DbId(99), "books", 1).await,
            Err(Error::DbNotExists)
        ));
    }

    #[tokio::test]
    async fn duplicate_names_rejected() {
        let cluster = control_plane();
        let db = cluster.create_db("library").await.unwrap();
        assert!(cluster.create_db("library").await.is_err());

        cluster.create_space(db.id(), "books", 1).await.unwrap();
        assert!(cluster.create_space(db.id(), "books", 1).await.is_err());
    }

    #[tokio::test]
    async fn recover_rebuilds_caches() {
        let topo: Arc<dyn TopoStore> = Arc::new(MemTopoStore::new());

        let before = ControlPlane::new(MasterConfig::default(), topo.clone());
        let db = before.create_db("library").await.unwrap();
        let space = before.create_space(db.id(), "books", 2).await.unwrap();
        let (db_id, space_id) = (db.id(), space.id());

        let after = ControlPlane::new(MasterConfig::default(), topo);
        after.recover().await.unwrap();

        assert_eq!(after.partition_cache.len(), 2);
        assert_eq!(after.db_cache.find_db_by_name("library").unwrap().id(), db_id);
        let space = after.find_space(db_id, space_id).unwrap();
        assert!(space.search(SlotId(0)).is_some());
        assert!(space.search(SlotId(u32::MAX)).is_some());

        // Idempotent.
        after.recover().await.unwrap();
        assert_eq!(after.partition_cache.len(), 2);
        assert_eq!(after.find_space(db_id, space_id).unwrap().partition_count(), 2);
    }
}
