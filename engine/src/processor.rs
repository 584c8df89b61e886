//! Sync processor - replays queued operations against the remote backend.
//!
//! A pass walks the eligible entries oldest-first. Each entry is claimed
//! (`pending -> syncing`), routed to the handler registered for its
//! `(entity type, operation type)` pair, and then removed on success or
//! rescheduled on failure. Passes may overlap; the claim is what keeps two of
//! them off the same entry.

use crate::{
    cache::EntityCache,
    conflict::ConflictResolver,
    error::Result,
    queue::SyncQueue,
    record::{provisional_id, provisional_origin},
    remote::RemoteBackend,
    EntityId, EntityType, Error, OperationId, OperationType, QueuedOperation, RemoteEntity,
    SyncStatus, TripId, Version,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Dispatch key of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub entity_type: EntityType,
    pub operation_type: OperationType,
}

impl Route {
    pub fn new(entity_type: EntityType, operation_type: OperationType) -> Self {
        Self {
            entity_type,
            operation_type,
        }
    }

    pub fn of(op: &QueuedOperation) -> Self {
        Self::new(op.entity_type, op.operation_type)
    }
}

/// What a handler receives for one queued operation.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerRequest {
    /// Queue entry id. Creates must pass it to the backend as the idempotency
    /// key, so a retried create never produces a duplicate.
    pub operation_id: OperationId,
    pub entity_type: EntityType,
    pub operation_type: OperationType,
    pub trip_id: TripId,
    pub entity_id: Option<EntityId>,
    pub payload: serde_json::Value,
    pub version: Option<Version>,
}

impl HandlerRequest {
    pub fn idempotency_key(&self) -> &str {
        &self.operation_id
    }

    /// The target entity id, or `MissingEntityId` for malformed updates and
    /// deletes.
    pub fn require_entity_id(&self) -> Result<&str> {
        self.entity_id.as_deref().ok_or(Error::MissingEntityId {
            entity_type: self.entity_type,
            operation: self.operation_type,
        })
    }
}

impl From<&QueuedOperation> for HandlerRequest {
    fn from(op: &QueuedOperation) -> Self {
        Self {
            operation_id: op.id.clone(),
            entity_type: op.entity_type,
            operation_type: op.operation_type,
            trip_id: op.trip_id.clone(),
            entity_id: op.entity_id.clone(),
            payload: op.payload.clone(),
            version: op.version,
        }
    }
}

/// Result of a successful handler call, applied to the entity cache.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The entity as the server now has it
    Entity(RemoteEntity),
    /// The entity no longer exists
    Removed,
}

/// Applies one queued operation remotely.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: HandlerRequest) -> Result<HandlerOutcome>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutcome>> + Send + 'static,
{
    async fn handle(&self, request: HandlerRequest) -> Result<HandlerOutcome> {
        (self)(request).await
    }
}

/// Routing table from `(entity type, operation type)` to handler.
///
/// An absent route is a valid state: the processor leaves such entries
/// queued until a handler shows up.
#[derive(Clone, Default)]
pub struct HandlerTable {
    routes: HashMap<Route, Arc<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure for a route, replacing any previous one.
    pub fn register<F, Fut>(
        &mut self,
        entity_type: EntityType,
        operation_type: OperationType,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(HandlerRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutcome>> + Send + 'static,
    {
        self.register_handler(entity_type, operation_type, Arc::new(handler))
    }

    pub fn register_handler(
        &mut self,
        entity_type: EntityType,
        operation_type: OperationType,
        handler: Arc<dyn Handler>,
    ) -> &mut Self {
        self.routes
            .insert(Route::new(entity_type, operation_type), handler);
        self
    }

    pub fn unregister(&mut self, entity_type: EntityType, operation_type: OperationType) -> bool {
        self.routes
            .remove(&Route::new(entity_type, operation_type))
            .is_some()
    }

    pub fn get(&self, route: Route) -> Option<Arc<dyn Handler>> {
        self.routes.get(&route).cloned()
    }

    pub fn contains(&self, route: Route) -> bool {
        self.routes.contains_key(&route)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// A table routing every syncable entity type and operation to
    /// `backend`. Updates go through `resolver`.
    pub fn for_backend(backend: Arc<dyn RemoteBackend>, resolver: ConflictResolver) -> Self {
        let handler: Arc<dyn Handler> = Arc::new(BackendHandler { backend, resolver });
        let mut table = Self::new();
        for entity_type in EntityType::SYNCABLE {
            for operation_type in OperationType::ALL {
                table.register_handler(entity_type, operation_type, handler.clone());
            }
        }
        table
    }
}

/// Forwards queued operations to a [`RemoteBackend`].
struct BackendHandler {
    backend: Arc<dyn RemoteBackend>,
    resolver: ConflictResolver,
}

#[async_trait]
impl Handler for BackendHandler {
    async fn handle(&self, request: HandlerRequest) -> Result<HandlerOutcome> {
        match request.operation_type {
            OperationType::Create => {
                let entity = self
                    .backend
                    .create(
                        request.entity_type,
                        &request.trip_id,
                        request.payload.clone(),
                        Some(request.idempotency_key()),
                    )
                    .await?;
                Ok(HandlerOutcome::Entity(entity))
            }
            OperationType::Update => {
                let entity_id = request.require_entity_id()?;
                let entity = self
                    .resolver
                    .update(
                        self.backend.as_ref(),
                        request.entity_type,
                        entity_id,
                        request.payload.clone(),
                        request.version,
                    )
                    .await?;
                Ok(HandlerOutcome::Entity(entity))
            }
            OperationType::Delete => {
                let entity_id = request.require_entity_id()?;
                self.backend.delete(request.entity_type, entity_id).await?;
                Ok(HandlerOutcome::Removed)
            }
        }
    }
}

/// Counts from one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    /// Applied remotely and removed from the queue
    pub processed: usize,
    /// Hit the retry ceiling during this pass
    pub failed: usize,
    /// Failed but rescheduled
    pub retried: usize,
    /// Claimed by another pass or removed before this one got to them
    pub skipped: usize,
    /// Left pending because no handler is registered
    pub unrouted: usize,
    /// Left pending until the create of their target entity syncs
    pub deferred: usize,
}

impl ProcessSummary {
    /// Entries this pass actually attempted.
    pub fn attempted(&self) -> usize {
        self.processed + self.failed + self.retried
    }
}

/// Drains the sync queue through a [`HandlerTable`].
pub struct SyncProcessor {
    queue: SyncQueue,
    cache: EntityCache,
    handlers: HandlerTable,
}

impl SyncProcessor {
    pub fn new(queue: SyncQueue, cache: EntityCache, handlers: HandlerTable) -> Self {
        Self {
            queue,
            cache,
            handlers,
        }
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Run one processing pass over every eligible entry.
    ///
    /// Call only while the backend is reachable. Handler failures are
    /// recorded on the entry; only local store errors are returned.
    pub async fn process_pending(&self) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();
        let eligible = self.queue.eligible_for_retry().await?;

        if eligible.is_empty() {
            return Ok(summary);
        }
        tracing::debug!(eligible = eligible.len(), "Starting sync pass");

        for candidate in eligible {
            let Some(op) = self.queue.claim(&candidate.id).await? else {
                tracing::debug!(operation_id = %candidate.id, "Already claimed, skipping");
                summary.skipped += 1;
                continue;
            };

            // The target was created offline and the server has not assigned
            // its id yet. Sending the provisional id would only 404.
            if let Some(create_id) = op.entity_id.as_deref().and_then(provisional_origin) {
                if self.queue.get(create_id).await?.is_some() {
                    tracing::debug!(
                        operation_id = %op.id,
                        create_id,
                        "Target not created yet, deferring"
                    );
                    self.queue
                        .set_status(&op.id, SyncStatus::Pending, false)
                        .await?;
                    summary.deferred += 1;
                    continue;
                }
            }

            let Some(handler) = self.handlers.get(Route::of(&op)) else {
                tracing::warn!(
                    operation_id = %op.id,
                    entity_type = %op.entity_type,
                    operation_type = %op.operation_type,
                    "No handler registered, leaving operation queued"
                );
                self.queue
                    .set_status(&op.id, SyncStatus::Pending, false)
                    .await?;
                summary.unrouted += 1;
                continue;
            };

            match handler.handle(HandlerRequest::from(&op)).await {
                Ok(outcome) => {
                    // Rebind before removal so no pass ever sees the create
                    // gone while dependents still carry the provisional id.
                    if let (OperationType::Create, HandlerOutcome::Entity(entity)) =
                        (op.operation_type, &outcome)
                    {
                        let provisional = provisional_id(&op.id);
                        self.queue
                            .rebind_entity(op.entity_type, &provisional, &entity.entity_id)
                            .await?;
                    }
                    self.queue.remove(&op.id).await?;
                    self.apply_outcome(&op, outcome).await?;
                    tracing::info!(
                        operation_id = %op.id,
                        entity_type = %op.entity_type,
                        operation_type = %op.operation_type,
                        trip_id = %op.trip_id,
                        "Synced operation"
                    );
                    summary.processed += 1;
                }
                Err(err) => match self.queue.record_failure(&op.id).await? {
                    Some(updated) if updated.status == SyncStatus::Failed => {
                        tracing::error!(
                            operation_id = %op.id,
                            entity_type = %op.entity_type,
                            retry_count = updated.retry_count,
                            error = %err,
                            "Operation failed permanently"
                        );
                        summary.failed += 1;
                    }
                    Some(updated) => {
                        tracing::warn!(
                            operation_id = %op.id,
                            entity_type = %op.entity_type,
                            retry_count = updated.retry_count,
                            error = %err,
                            "Operation failed, will retry"
                        );
                        summary.retried += 1;
                    }
                    // Removed out from under us, e.g. dismissed by the user
                    None => summary.skipped += 1,
                },
            }
        }

        tracing::debug!(
            processed = summary.processed,
            failed = summary.failed,
            retried = summary.retried,
            skipped = summary.skipped,
            unrouted = summary.unrouted,
            deferred = summary.deferred,
            "Sync pass finished"
        );
        Ok(summary)
    }

    async fn apply_outcome(&self, op: &QueuedOperation, outcome: HandlerOutcome) -> Result<()> {
        match outcome {
            HandlerOutcome::Entity(entity) => {
                self.cache
                    .put(
                        entity.entity_type,
                        &entity.entity_id,
                        &entity.trip_id,
                        entity.data,
                        Some(entity.version),
                    )
                    .await?;
                if op.operation_type == OperationType::Create {
                    self.cache
                        .remove(op.entity_type, &provisional_id(&op.id))
                        .await?;
                }
            }
            HandlerOutcome::Removed => {
                if let Some(entity_id) = &op.entity_id {
                    self.cache.remove(op.entity_type, entity_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Start a background worker driving passes from a connectivity signal.
    ///
    /// A pass starts on every offline-to-online transition and on each tick
    /// of `interval` while online. Passes run as separate tasks and may
    /// overlap.
    pub fn spawn(self: Arc<Self>, mut connectivity: watch::Receiver<bool>, interval: Duration) -> SyncWorker {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut online = *connectivity.borrow_and_update();

            tracing::info!(online, ?interval, "Sync worker started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            tracing::debug!("Connectivity signal closed");
                            break;
                        }
                        let now_online = *connectivity.borrow_and_update();
                        if now_online && !online {
                            tracing::info!("Connectivity restored, starting sync pass");
                            Arc::clone(&self).spawn_pass();
                        }
                        online = now_online;
                    }
                    _ = ticker.tick() => {
                        if online {
                            Arc::clone(&self).spawn_pass();
                        }
                    }
                }
            }

            tracing::info!("Sync worker stopped");
        });

        SyncWorker {
            shutdown: shutdown_tx,
            handle,
        }
    }

    fn spawn_pass(self: Arc<Self>) {
        tokio::spawn(async move {
            if let Err(e) = self.process_pending().await {
                tracing::error!(error = %e, "Sync pass aborted");
            }
        });
    }
}

/// Handle to a worker started by [`SyncProcessor::spawn`].
pub struct SyncWorker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Stop the worker loop. Passes already running finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, MemoryStore, NewOperation, SyncConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    struct Harness {
        queue: SyncQueue,
        cache: EntityCache,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = SyncConfig::default();
        Harness {
            queue: SyncQueue::new(store.clone(), clock.clone(), &config),
            cache: EntityCache::new(store, clock.clone(), &config),
            clock,
        }
    }

    fn echo(req: &HandlerRequest, id: &str) -> HandlerOutcome {
        HandlerOutcome::Entity(RemoteEntity::new(
            id,
            req.entity_type,
            req.trip_id.clone(),
            req.payload.clone(),
            1,
        ))
    }

    #[tokio::test]
    async fn end_to_end_create() {
        let h = harness();
        h.queue
            .enqueue(NewOperation::create(
                EntityType::Task,
                "T1",
                json!({"title": "Pack bags"}),
            ))
            .await
            .unwrap();

        let mut handlers = HandlerTable::new();
        handlers.register(EntityType::Task, OperationType::Create, |req: HandlerRequest| async move {
            Ok(HandlerOutcome::Entity(RemoteEntity::new(
                "srv-1",
                req.entity_type,
                req.trip_id,
                json!({"id": "srv-1", "title": "Pack bags"}),
                1,
            )))
        });

        let processor = SyncProcessor::new(h.queue.clone(), h.cache.clone(), handlers);
        let summary = processor.process_pending().await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 0);
        assert!(h.queue.is_empty().await.unwrap());

        let cached = h.cache.get(EntityType::Task, "srv-1").await.unwrap().unwrap();
        assert_eq!(cached.data, json!({"id": "srv-1", "title": "Pack bags"}));
        assert_eq!(cached.trip_id, "T1");
        assert_eq!(cached.version, Some(1));
    }

    #[tokio::test]
    async fn missing_handler_keeps_operation_pending() {
        let h = harness();
        let id = h
            .queue
            .enqueue(NewOperation::create(
                EntityType::PollVote,
                "trip-1",
                json!({"pollId": "p", "optionId": "o"}),
            ))
            .await
            .unwrap();

        let processor = SyncProcessor::new(h.queue.clone(), h.cache.clone(), HandlerTable::new());
        let summary = processor.process_pending().await.unwrap();

        assert_eq!(summary.unrouted, 1);
        assert_eq!(summary.attempted(), 0);

        let op = h.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(op.status, SyncStatus::Pending);
        assert_eq!(op.retry_count, 0);

        // Still eligible next time.
        let summary = processor.process_pending().await.unwrap();
        assert_eq!(summary.unrouted, 1);
    }

    #[tokio::test]
    async fn retry_ceiling() {
        let h = harness();
        let id = h
            .queue
            .enqueue(NewOperation::create(EntityType::Task, "trip-1", json!({"title": "x"})))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerTable::new();
        let counter = calls.clone();
        handlers.register(EntityType::Task, OperationType::Create, move |_req: HandlerRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Remote("connection refused".into())) }
        });
        let processor = SyncProcessor::new(h.queue.clone(), h.cache.clone(), handlers);

        let first = processor.process_pending().await.unwrap();
        assert_eq!(first.retried, 1);

        // Backoff not yet elapsed.
        h.clock.advance(Duration::from_secs(4));
        assert_eq!(processor.process_pending().await.unwrap().attempted(), 0);

        h.clock.advance(Duration::from_secs(1));
        assert_eq!(processor.process_pending().await.unwrap().retried, 1);

        h.clock.advance(Duration::from_secs(5));
        let last = processor.process_pending().await.unwrap();
        assert_eq!(last.failed, 1);

        let op = h.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(op.status, SyncStatus::Failed);
        assert_eq!(op.retry_count, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        h.clock.advance(Duration::from_secs(3600));
        processor.process_pending().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn overlapping_pass_respects_backoff() {
        let h = harness();
        h.queue
            .enqueue(NewOperation::create(
                EntityType::ChatMessage,
                "trip-1",
                json!({"content": "slow"}),
            ))
            .await
            .unwrap();
        h.clock.advance(Duration::from_millis(1));
        let task = h
            .queue
            .enqueue(NewOperation::create(EntityType::Task, "trip-1", json!({"title": "x"})))
            .await
            .unwrap();

        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let task_calls = Arc::new(AtomicUsize::new(0));

        let mut handlers = HandlerTable::new();
        let (entered_tx, release_rx) = (entered.clone(), release.clone());
        handlers.register(EntityType::ChatMessage, OperationType::Create, move |req: HandlerRequest| {
            let (entered, release) = (entered_tx.clone(), release_rx.clone());
            async move {
                entered.notify_one();
                release.notified().await;
                Ok(echo(&req, "srv-chat"))
            }
        });
        let counter = task_calls.clone();
        handlers.register(EntityType::Task, OperationType::Create, move |_req: HandlerRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Remote("timed out".into())) }
        });
        let processor = Arc::new(SyncProcessor::new(h.queue.clone(), h.cache.clone(), handlers));

        // Pass A reads both entries, then stalls on the chat message.
        let slow = tokio::spawn({
            let processor = processor.clone();
            async move { processor.process_pending().await.unwrap() }
        });
        entered.notified().await;

        // Pass B fails the task while A still holds it in its candidate list.
        let fast = processor.process_pending().await.unwrap();
        assert_eq!(fast.retried, 1);

        release.notify_one();
        let slow = slow.await.unwrap();
        assert_eq!(slow.processed, 1);
        assert_eq!(slow.skipped, 1);

        assert_eq!(task_calls.load(Ordering::SeqCst), 1);
        let op = h.queue.get(&task).await.unwrap().unwrap();
        assert_eq!(op.retry_count, 1);
        assert_eq!(op.status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn dependents_wait_for_offline_create() {
        let h = harness();
        let create = h
            .queue
            .enqueue(NewOperation::create(EntityType::Task, "trip-1", json!({"title": "a"})))
            .await
            .unwrap();
        let local = provisional_id(&create);
        h.clock.advance(Duration::from_millis(1));
        let update = h
            .queue
            .enqueue(NewOperation::update(
                EntityType::Task,
                "trip-1",
                local.clone(),
                json!({"title": "b"}),
                None,
            ))
            .await
            .unwrap();

        let creates_fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let updated_ids = Arc::new(Mutex::new(Vec::new()));

        let mut handlers = HandlerTable::new();
        let failing = creates_fail.clone();
        handlers.register(EntityType::Task, OperationType::Create, move |req: HandlerRequest| {
            let fail = failing.load(Ordering::SeqCst);
            async move {
                if fail {
                    Err(Error::Remote("connection reset".into()))
                } else {
                    Ok(echo(&req, "srv-5"))
                }
            }
        });
        let sink = updated_ids.clone();
        handlers.register(EntityType::Task, OperationType::Update, move |req: HandlerRequest| {
            sink.lock().unwrap().push(req.entity_id.clone());
            async move { Ok(echo(&req, "srv-5")) }
        });
        let processor = SyncProcessor::new(h.queue.clone(), h.cache.clone(), handlers);

        // The create fails, so the update is held back without spending a retry.
        let first = processor.process_pending().await.unwrap();
        assert_eq!(first.retried, 1);
        assert_eq!(first.deferred, 1);
        let op = h.queue.get(&update).await.unwrap().unwrap();
        assert_eq!(op.retry_count, 0);
        assert!(updated_ids.lock().unwrap().is_empty());

        creates_fail.store(false, Ordering::SeqCst);
        h.clock.advance(Duration::from_secs(5));
        let second = processor.process_pending().await.unwrap();
        assert_eq!(second.processed, 2);
        assert_eq!(*updated_ids.lock().unwrap(), vec![Some("srv-5".to_string())]);
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn delete_outcome_clears_cache() {
        let h = harness();
        h.cache
            .put(EntityType::ChatMessage, "m-1", "trip-1", json!({"content": "hi"}), Some(2))
            .await
            .unwrap();
        h.queue
            .enqueue(NewOperation::delete(EntityType::ChatMessage, "trip-1", "m-1"))
            .await
            .unwrap();

        let mut handlers = HandlerTable::new();
        handlers.register(EntityType::ChatMessage, OperationType::Delete, |_req: HandlerRequest| async {
            Ok(HandlerOutcome::Removed)
        });
        let processor = SyncProcessor::new(h.queue.clone(), h.cache.clone(), handlers);

        assert_eq!(processor.process_pending().await.unwrap().processed, 1);
        assert!(h.cache.get(EntityType::ChatMessage, "m-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_replaces_provisional_entry() {
        let h = harness();
        let id = h
            .queue
            .enqueue(NewOperation::create(EntityType::Task, "trip-1", json!({"title": "x"})))
            .await
            .unwrap();
        h.cache
            .put(EntityType::Task, &provisional_id(&id), "trip-1", json!({"title": "x"}), None)
            .await
            .unwrap();

        let mut handlers = HandlerTable::new();
        handlers.register(EntityType::Task, OperationType::Create, |req: HandlerRequest| async move {
            Ok(echo(&req, "srv-9"))
        });
        let processor = SyncProcessor::new(h.queue.clone(), h.cache.clone(), handlers);
        processor.process_pending().await.unwrap();

        let trip = h.cache.get_all_for_trip("trip-1", None).await.unwrap();
        assert_eq!(trip.len(), 1);
        assert_eq!(trip[0].entity_id, "srv-9");
    }

    #[tokio::test]
    async fn handler_receives_operation_id_as_idempotency_key() {
        let h = harness();
        let id = h
            .queue
            .enqueue(NewOperation::create(EntityType::Task, "trip-1", json!({"title": "x"})))
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut handlers = HandlerTable::new();
        handlers.register(EntityType::Task, OperationType::Create, move |req: HandlerRequest| {
            sink.lock().unwrap().push(req.idempotency_key().to_string());
            async move { Ok(echo(&req, "srv-1")) }
        });
        SyncProcessor::new(h.queue.clone(), h.cache.clone(), handlers)
            .process_pending()
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn passes_process_in_enqueue_order() {
        let h = harness();
        let mut expected = Vec::new();
        for i in 0..5 {
            let id = h
                .queue
                .enqueue(NewOperation::update(
                    EntityType::Task,
                    "trip-1",
                    "t-1",
                    json!({ "title": format!("v{i}") }),
                    None,
                ))
                .await
                .unwrap();
            expected.push(id);
            h.clock.advance(Duration::from_millis(1));
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut handlers = HandlerTable::new();
        handlers.register(EntityType::Task, OperationType::Update, move |req: HandlerRequest| {
            sink.lock().unwrap().push(req.operation_id.clone());
            async move { Ok(echo(&req, "t-1")) }
        });
        SyncProcessor::new(h.queue.clone(), h.cache.clone(), handlers)
            .process_pending()
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), expected);
        let cached = h.cache.get(EntityType::Task, "t-1").await.unwrap().unwrap();
        assert_eq!(cached.data["title"], "v4");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_passes_never_double_process() {
        let h = harness();
        for i in 0..20 {
            h.queue
                .enqueue(NewOperation::create(
                    EntityType::ChatMessage,
                    "trip-1",
                    json!({ "content": format!("msg {i}") }),
                ))
                .await
                .unwrap();
        }

        let invocations: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
        let sink = invocations.clone();
        let mut handlers = HandlerTable::new();
        handlers.register(EntityType::ChatMessage, OperationType::Create, move |req: HandlerRequest| {
            *sink.lock().unwrap().entry(req.operation_id.clone()).or_default() += 1;
            async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(echo(&req, &format!("srv-{}", req.operation_id)))
            }
        });
        let processor = Arc::new(SyncProcessor::new(h.queue.clone(), h.cache.clone(), handlers));

        let passes: Vec<_> = (0..4)
            .map(|_| {
                let processor = processor.clone();
                tokio::spawn(async move { processor.process_pending().await.unwrap() })
            })
            .collect();

        let mut processed = 0;
        for pass in passes {
            processed += pass.await.unwrap().processed;
        }

        assert_eq!(processed, 20);
        assert!(h.queue.is_empty().await.unwrap());

        let invocations = invocations.lock().unwrap();
        assert_eq!(invocations.len(), 20);
        assert!(invocations.values().all(|&n| n == 1));
    }

    #[tokio::test]
    async fn worker_syncs_when_connectivity_returns() {
        let h = harness();
        h.queue
            .enqueue(NewOperation::create(EntityType::Task, "trip-1", json!({"title": "x"})))
            .await
            .unwrap();

        let mut handlers = HandlerTable::new();
        handlers.register(EntityType::Task, OperationType::Create, |req: HandlerRequest| async move {
            Ok(echo(&req, "srv-1"))
        });
        let processor = Arc::new(SyncProcessor::new(h.queue.clone(), h.cache.clone(), handlers));

        let (online_tx, online_rx) = watch::channel(false);
        let worker = processor.spawn(online_rx, Duration::from_secs(3600));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.queue.len().await.unwrap(), 1);

        online_tx.send(true).unwrap();
        for _ in 0..100 {
            if h.queue.is_empty().await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.queue.is_empty().await.unwrap());

        worker.shutdown().await;
    }

    #[test]
    fn backend_table_covers_syncable_routes() {
        struct Unreachable;

        #[async_trait]
        impl RemoteBackend for Unreachable {
            async fn create(
                &self,
                _: EntityType,
                _: &str,
                _: serde_json::Value,
                _: Option<&str>,
            ) -> Result<RemoteEntity> {
                Err(Error::Remote("offline".into()))
            }
            async fn update(
                &self,
                _: EntityType,
                _: &str,
                _: serde_json::Value,
                _: Version,
            ) -> Result<RemoteEntity> {
                Err(Error::Remote("offline".into()))
            }
            async fn delete(&self, _: EntityType, _: &str) -> Result<()> {
                Err(Error::Remote("offline".into()))
            }
            async fn fetch(&self, _: EntityType, _: &str) -> Result<RemoteEntity> {
                Err(Error::Remote("offline".into()))
            }
            async fn list(&self, _: &str, _: EntityType) -> Result<Vec<RemoteEntity>> {
                Err(Error::Remote("offline".into()))
            }
        }

        let table = HandlerTable::for_backend(Arc::new(Unreachable), ConflictResolver::default());
        assert_eq!(table.len(), 12);
        assert!(!table.contains(Route::new(EntityType::BaseCamp, OperationType::Update)));
        assert!(table.contains(Route::new(EntityType::PollVote, OperationType::Delete)));
    }
}
