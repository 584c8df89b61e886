//! Client facade - one entry point choosing between the online and offline
//! write paths.
//!
//! Online, a mutation goes straight to the backend (updates through the
//! [`ConflictResolver`]) and the cache is refreshed with the result. Offline,
//! or when the backend is unreachable, the mutation is queued and reflected
//! in the cache optimistically; the [`SyncProcessor`] replays it later.

use crate::{
    cache::EntityCache,
    clock::Clock,
    conflict::ConflictResolver,
    error::Result,
    processor::{HandlerTable, ProcessSummary, SyncProcessor, SyncWorker},
    queue::SyncQueue,
    record::{provisional_id, provisional_origin},
    remote::RemoteBackend,
    store::LocalStore,
    CachedEntity, EntityPayload, EntityType, Error, NewOperation, OperationId, RemoteEntity,
    SyncConfig, Version,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// How a mutation was carried out.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// Written to the backend; this is the server's copy
    Applied(RemoteEntity),
    /// Deleted on the backend
    Deleted,
    /// Queued for replay once connectivity returns
    Queued { operation_id: OperationId },
}

impl MutationOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, MutationOutcome::Queued { .. })
    }
}

/// Offline-first access to trip entities.
pub struct TripSync {
    queue: SyncQueue,
    cache: EntityCache,
    processor: Arc<SyncProcessor>,
    backend: Arc<dyn RemoteBackend>,
    resolver: ConflictResolver,
    online: watch::Sender<bool>,
    sync_interval: Duration,
}

impl TripSync {
    /// Build a client whose queue replays through `backend`.
    ///
    /// Entries left `syncing` by a previous process are reset to `pending`.
    /// Starts offline; call [`Self::set_online`] once connectivity is known.
    pub async fn new(
        store: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn RemoteBackend>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let resolver = ConflictResolver::from_config(config);
        let handlers = HandlerTable::for_backend(backend.clone(), resolver);
        Self::with_handlers(store, clock, backend, config, handlers).await
    }

    /// Like [`Self::new`] but replaying through a custom handler table.
    pub async fn with_handlers(
        store: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn RemoteBackend>,
        config: &SyncConfig,
        handlers: HandlerTable,
    ) -> Result<Self> {
        let queue = SyncQueue::new(store.clone(), clock.clone(), config);
        let cache = EntityCache::new(store, clock, config);
        queue.recover_interrupted().await?;

        let processor = Arc::new(SyncProcessor::new(queue.clone(), cache.clone(), handlers));
        let (online, _) = watch::channel(false);

        Ok(Self {
            queue,
            cache,
            processor,
            backend,
            resolver: ConflictResolver::from_config(config),
            online,
            sync_interval: config.sync_interval,
        })
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn processor(&self) -> &Arc<SyncProcessor> {
        &self.processor
    }

    /// Report a connectivity change. Workers started with [`Self::start`]
    /// begin a pass on every offline-to-online transition.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.send_replace(online);
        if was_online != online {
            tracing::info!(online, "Connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Subscribe to connectivity changes.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Create an entity.
    pub async fn create(
        &self,
        entity_type: EntityType,
        trip_id: &str,
        payload: serde_json::Value,
    ) -> Result<MutationOutcome> {
        EntityPayload::decode(entity_type, &payload)?;
        // Doubles as the idempotency key, so a create that reached the server
        // before the connection dropped is not duplicated on replay.
        let operation_id = Uuid::new_v4().to_string();

        if self.is_online() {
            match self
                .backend
                .create(entity_type, trip_id, payload.clone(), Some(&operation_id))
                .await
            {
                Ok(entity) => return self.applied(entity).await,
                Err(err) if self.should_queue(entity_type, &err) => {
                    tracing::warn!(
                        entity_type = %entity_type,
                        trip_id,
                        error = %err,
                        "Backend unreachable, queueing create"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let operation_id = self
            .queue
            .enqueue_as(
                operation_id,
                NewOperation::create(entity_type, trip_id, payload.clone()),
            )
            .await?;
        self.cache
            .put(entity_type, &provisional_id(&operation_id), trip_id, payload, None)
            .await?;
        Ok(MutationOutcome::Queued { operation_id })
    }

    /// Update an entity based on `known_version`, or on the cached version
    /// when not given.
    pub async fn update(
        &self,
        entity_type: EntityType,
        trip_id: &str,
        entity_id: &str,
        payload: serde_json::Value,
        known_version: Option<Version>,
    ) -> Result<MutationOutcome> {
        EntityPayload::decode(entity_type, &payload)?;
        let version = match known_version {
            Some(version) => Some(version),
            None => self
                .cache
                .get(entity_type, entity_id)
                .await?
                .and_then(|cached| cached.version),
        };

        if self.is_online() && !self.awaiting_create(entity_id).await? {
            match self
                .resolver
                .update(
                    self.backend.as_ref(),
                    entity_type,
                    entity_id,
                    payload.clone(),
                    version,
                )
                .await
            {
                Ok(entity) => return self.applied(entity).await,
                Err(err) if self.should_queue(entity_type, &err) => {
                    tracing::warn!(
                        entity_type = %entity_type,
                        entity_id,
                        error = %err,
                        "Backend unreachable, queueing update"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let operation_id = self
            .queue
            .enqueue(NewOperation::update(
                entity_type,
                trip_id,
                entity_id,
                payload.clone(),
                version,
            ))
            .await?;
        self.cache
            .put(entity_type, entity_id, trip_id, payload, version)
            .await?;
        Ok(MutationOutcome::Queued { operation_id })
    }

    /// Delete an entity. Deleting an entity that is already gone succeeds.
    pub async fn delete(
        &self,
        entity_type: EntityType,
        trip_id: &str,
        entity_id: &str,
    ) -> Result<MutationOutcome> {
        if self.is_online() && !self.awaiting_create(entity_id).await? {
            match self.backend.delete(entity_type, entity_id).await {
                Ok(()) => {
                    self.cache.remove(entity_type, entity_id).await?;
                    return Ok(MutationOutcome::Deleted);
                }
                Err(err) if self.should_queue(entity_type, &err) => {
                    tracing::warn!(
                        entity_type = %entity_type,
                        entity_id,
                        error = %err,
                        "Backend unreachable, queueing delete"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let operation_id = self
            .queue
            .enqueue(NewOperation::delete(entity_type, trip_id, entity_id))
            .await?;
        self.cache.remove(entity_type, entity_id).await?;
        Ok(MutationOutcome::Queued { operation_id })
    }

    /// Read through the cache, falling back to the backend when online.
    ///
    /// An unreachable backend reads as absent rather than as an error.
    pub async fn get(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<CachedEntity>> {
        if let Some(cached) = self.cache.get(entity_type, entity_id).await? {
            return Ok(Some(cached));
        }
        if !self.is_online() {
            return Ok(None);
        }

        match self.backend.fetch(entity_type, entity_id).await {
            Ok(entity) => Ok(Some(self.cache_remote(entity).await?)),
            Err(Error::EntityNotFound { .. }) => Ok(None),
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    entity_type = %entity_type,
                    entity_id,
                    error = %err,
                    "Fetch failed, treating as absent"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Cached entities of a trip, optionally of one type.
    pub async fn list_for_trip(
        &self,
        trip_id: &str,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<CachedEntity>> {
        self.cache.get_all_for_trip(trip_id, entity_type).await
    }

    /// Re-read a trip's entities of one type from the backend into the cache.
    pub async fn refresh(&self, trip_id: &str, entity_type: EntityType) -> Result<Vec<CachedEntity>> {
        let entities = self.backend.list(trip_id, entity_type).await?;
        let mut cached = Vec::with_capacity(entities.len());
        for entity in entities {
            cached.push(self.cache_remote(entity).await?);
        }
        tracing::debug!(trip_id, entity_type = %entity_type, count = cached.len(), "Refreshed trip");
        Ok(cached)
    }

    /// Run a processing pass now. Does nothing while offline.
    pub async fn sync_now(&self) -> Result<ProcessSummary> {
        if !self.is_online() {
            tracing::debug!("Offline, skipping sync pass");
            return Ok(ProcessSummary::default());
        }
        self.processor.process_pending().await
    }

    /// Move every `failed` entry back to `pending`. Returns how many moved.
    pub async fn retry_failed(&self) -> Result<usize> {
        let mut requeued = 0;
        for op in self.queue.failed().await? {
            if self.queue.requeue(&op.id).await?.is_some() {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// Start the background sync worker on the configured interval.
    ///
    /// Dropping the returned handle stops the worker.
    pub fn start(&self) -> SyncWorker {
        self.processor
            .clone()
            .spawn(self.online.subscribe(), self.sync_interval)
    }

    /// Whether `entity_id` is a provisional id whose create is still queued.
    /// Mutations of such an entity must queue behind the create.
    async fn awaiting_create(&self, entity_id: &str) -> Result<bool> {
        match provisional_origin(entity_id) {
            Some(create_id) => Ok(self.queue.get(create_id).await?.is_some()),
            None => Ok(false),
        }
    }

    /// Queue only transient failures of syncable types. The reserved type
    /// must never land in the queue, so its errors surface instead.
    fn should_queue(&self, entity_type: EntityType, err: &Error) -> bool {
        err.is_transient() && entity_type.is_syncable()
    }

    async fn applied(&self, entity: RemoteEntity) -> Result<MutationOutcome> {
        self.cache_remote(entity.clone()).await?;
        Ok(MutationOutcome::Applied(entity))
    }

    async fn cache_remote(&self, entity: RemoteEntity) -> Result<CachedEntity> {
        self.cache
            .put(
                entity.entity_type,
                &entity.entity_id,
                &entity.trip_id,
                entity.data,
                Some(entity.version),
            )
            .await
    }
}
