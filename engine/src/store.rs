//! Local store - the persistent home of the sync queue and the entity cache.
//!
//! [`LocalStore`] is the seam to whatever durable key-value engine the host
//! platform provides. The engine only needs get/put/delete/list plus lookups
//! by secondary index, and one atomic read-modify-write on queue rows.
//!
//! [`MemoryStore`] keeps both tables in memory behind a single mutex and can
//! write every change through to a JSON [`StoreSnapshot`] file.

use crate::{
    error::Result, CachedEntity, EntityType, Error, OperationId, QueuedOperation, StoreSnapshot,
    SyncStatus, TripId,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Storage backend for the queue and cache tables.
///
/// Implementations must be crash durable: once a mutating call returns `Ok`,
/// the change survives a process restart. A mutating call that returns `Err`
/// leaves both tables as they were.
#[async_trait]
pub trait LocalStore: Send + Sync {
    // Queue table (primary key: operation id, secondary index: status)

    /// Insert or replace a queue row.
    async fn put_operation(&self, op: QueuedOperation) -> Result<()>;

    async fn get_operation(&self, id: &str) -> Result<Option<QueuedOperation>>;

    /// Delete a queue row. Returns false if it was already gone.
    async fn delete_operation(&self, id: &str) -> Result<bool>;

    async fn all_operations(&self) -> Result<Vec<QueuedOperation>>;

    async fn operations_by_status(&self, status: SyncStatus) -> Result<Vec<QueuedOperation>>;

    /// Atomically read, modify and write back one queue row.
    ///
    /// `apply` receives a copy of the current row and returns whether to
    /// commit its changes. No other call may observe or modify the row between
    /// the read and the write. Returns the committed row, or `None` when the
    /// row does not exist or `apply` declined.
    async fn update_operation(
        &self,
        id: &str,
        apply: &(dyn for<'a> Fn(&'a mut QueuedOperation) -> bool + Send + Sync),
    ) -> Result<Option<QueuedOperation>>;

    // Cache table (primary key: entityType:entityId, indexes: trip id, entity type)

    /// Insert or replace a cache row.
    async fn put_cached(&self, entity: CachedEntity) -> Result<()>;

    async fn get_cached(&self, key: &str) -> Result<Option<CachedEntity>>;

    /// Delete a cache row. Returns false if it was already gone.
    async fn delete_cached(&self, key: &str) -> Result<bool>;

    async fn all_cached(&self) -> Result<Vec<CachedEntity>>;

    async fn cached_by_trip(&self, trip_id: &str) -> Result<Vec<CachedEntity>>;

    async fn cached_by_type(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>>;
}

/// Both tables plus their secondary indexes.
#[derive(Debug, Default)]
struct Tables {
    queue: BTreeMap<OperationId, QueuedOperation>,
    by_status: HashMap<SyncStatus, BTreeSet<OperationId>>,
    cache: BTreeMap<String, CachedEntity>,
    by_trip: HashMap<TripId, BTreeSet<String>>,
    by_type: HashMap<EntityType, BTreeSet<String>>,
}

impl Tables {
    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut tables = Tables::default();
        for op in snapshot.queue {
            tables.insert_operation(op);
        }
        for entity in snapshot.cache.into_values() {
            tables.insert_cached(entity);
        }
        tables
    }

    fn to_snapshot(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new();

        let mut ops: Vec<_> = self.queue.values().cloned().collect();
        ops.sort_by(|a, b| (a.enqueued_at, &a.id).cmp(&(b.enqueued_at, &b.id)));
        snapshot.queue = ops;

        for entity in self.cache.values() {
            snapshot.add_cached(entity.clone());
        }
        snapshot
    }

    /// Returns the row it replaced.
    fn insert_operation(&mut self, op: QueuedOperation) -> Option<QueuedOperation> {
        let previous = self.remove_operation(&op.id);
        self.by_status
            .entry(op.status)
            .or_default()
            .insert(op.id.clone());
        self.queue.insert(op.id.clone(), op);
        previous
    }

    /// Put row `id` back to `previous`, or drop it if there was none.
    fn restore_operation(&mut self, id: &str, previous: Option<QueuedOperation>) {
        self.remove_operation(id);
        if let Some(op) = previous {
            self.insert_operation(op);
        }
    }

    fn remove_operation(&mut self, id: &str) -> Option<QueuedOperation> {
        let op = self.queue.remove(id)?;
        if let Some(ids) = self.by_status.get_mut(&op.status) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_status.remove(&op.status);
            }
        }
        Some(op)
    }

    /// Returns the row it replaced.
    fn insert_cached(&mut self, entity: CachedEntity) -> Option<CachedEntity> {
        let key = entity.key();
        let previous = self.remove_cached(&key);
        self.by_trip
            .entry(entity.trip_id.clone())
            .or_default()
            .insert(key.clone());
        self.by_type
            .entry(entity.entity_type)
            .or_default()
            .insert(key.clone());
        self.cache.insert(key, entity);
        previous
    }

    fn restore_cached(&mut self, key: &str, previous: Option<CachedEntity>) {
        self.remove_cached(key);
        if let Some(entity) = previous {
            self.insert_cached(entity);
        }
    }

    fn remove_cached(&mut self, key: &str) -> Option<CachedEntity> {
        let entity = self.cache.remove(key)?;
        if let Some(keys) = self.by_trip.get_mut(&entity.trip_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_trip.remove(&entity.trip_id);
            }
        }
        if let Some(keys) = self.by_type.get_mut(&entity.entity_type) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_type.remove(&entity.entity_type);
            }
        }
        Some(entity)
    }

    fn cached_for_keys(&self, keys: Option<&BTreeSet<String>>) -> Vec<CachedEntity> {
        keys.map(|keys| {
            keys.iter()
                .filter_map(|key| self.cache.get(key).cloned())
                .collect()
        })
        .unwrap_or_default()
    }
}

/// In-memory [`LocalStore`] with optional write-through JSON persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Snapshot file, when persistent
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Create an empty, non-persistent store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a non-persistent store seeded from a snapshot.
    ///
    /// Operations left `syncing` in the snapshot are reset to `pending`.
    pub fn from_snapshot(mut snapshot: StoreSnapshot) -> Result<Self> {
        snapshot.validate()?;
        snapshot.recover_interrupted();
        Ok(Self {
            tables: Mutex::new(Tables::from_snapshot(snapshot)),
            path: None,
        })
    }

    /// Open a persistent store backed by the snapshot file at `path`.
    ///
    /// A missing file yields an empty store; the file is created on the first
    /// write. Operations left `syncing` by a crashed process are reset to
    /// `pending`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut snapshot = match tokio::fs::read_to_string(&path).await {
            Ok(json) => StoreSnapshot::from_json(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreSnapshot::new(),
            Err(e) => return Err(e.into()),
        };

        let recovered = snapshot.recover_interrupted();
        if recovered > 0 {
            tracing::info!(
                path = %path.display(),
                recovered,
                "Reset interrupted operations to pending"
            );
        }

        tracing::debug!(
            path = %path.display(),
            queued = snapshot.queue.len(),
            cached = snapshot.cache.len(),
            "Opened local store"
        );

        Ok(Self {
            tables: Mutex::new(Tables::from_snapshot(snapshot)),
            path: Some(path),
        })
    }

    /// Export the current state of both tables.
    pub async fn snapshot(&self) -> StoreSnapshot {
        self.tables.lock().await.to_snapshot()
    }

    /// Path of the backing snapshot file, if persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the tables through to disk. Called with the lock held so that
    /// writes land in mutation order.
    async fn persist(&self, tables: &Tables) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = tables.to_snapshot().to_json()?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Persist an in-memory change, reverting it with `undo` if the write
    /// fails.
    async fn commit(
        &self,
        tables: &mut Tables,
        undo: impl FnOnce(&mut Tables) + Send,
    ) -> Result<()> {
        if let Err(e) = self.persist(tables).await {
            undo(tables);
            tracing::warn!(error = %e, "Local store write failed, change rolled back");
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn put_operation(&self, op: QueuedOperation) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let id = op.id.clone();
        let previous = tables.insert_operation(op);
        self.commit(&mut tables, move |t| t.restore_operation(&id, previous))
            .await
    }

    async fn get_operation(&self, id: &str) -> Result<Option<QueuedOperation>> {
        Ok(self.tables.lock().await.queue.get(id).cloned())
    }

    async fn delete_operation(&self, id: &str) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(removed) = tables.remove_operation(id) else {
            return Ok(false);
        };
        self.commit(&mut tables, move |t| {
            t.insert_operation(removed);
        })
        .await?;
        Ok(true)
    }

    async fn all_operations(&self) -> Result<Vec<QueuedOperation>> {
        Ok(self.tables.lock().await.queue.values().cloned().collect())
    }

    async fn operations_by_status(&self, status: SyncStatus) -> Result<Vec<QueuedOperation>> {
        let tables = self.tables.lock().await;
        let ops = tables
            .by_status
            .get(&status)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.queue.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(ops)
    }

    async fn update_operation(
        &self,
        id: &str,
        apply: &(dyn for<'a> Fn(&'a mut QueuedOperation) -> bool + Send + Sync),
    ) -> Result<Option<QueuedOperation>> {
        let mut tables = self.tables.lock().await;

        let Some(mut op) = tables.queue.get(id).cloned() else {
            return Ok(None);
        };
        if !apply(&mut op) {
            return Ok(None);
        }
        if op.id != id {
            return Err(Error::Store(format!(
                "update of operation {id} attempted to change its id"
            )));
        }

        let previous = tables.insert_operation(op.clone());
        let id = id.to_string();
        self.commit(&mut tables, move |t| t.restore_operation(&id, previous))
            .await?;
        Ok(Some(op))
    }

    async fn put_cached(&self, entity: CachedEntity) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let key = entity.key();
        let previous = tables.insert_cached(entity);
        self.commit(&mut tables, move |t| t.restore_cached(&key, previous))
            .await
    }

    async fn get_cached(&self, key: &str) -> Result<Option<CachedEntity>> {
        Ok(self.tables.lock().await.cache.get(key).cloned())
    }

    async fn delete_cached(&self, key: &str) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(removed) = tables.remove_cached(key) else {
            return Ok(false);
        };
        self.commit(&mut tables, move |t| {
            t.insert_cached(removed);
        })
        .await?;
        Ok(true)
    }

    async fn all_cached(&self) -> Result<Vec<CachedEntity>> {
        Ok(self.tables.lock().await.cache.values().cloned().collect())
    }

    async fn cached_by_trip(&self, trip_id: &str) -> Result<Vec<CachedEntity>> {
        let tables = self.tables.lock().await;
        Ok(tables.cached_for_keys(tables.by_trip.get(trip_id)))
    }

    async fn cached_by_type(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>> {
        let tables = self.tables.lock().await;
        Ok(tables.cached_for_keys(tables.by_type.get(&entity_type)))
    }
}
