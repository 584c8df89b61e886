//! # Tripsync Engine
//!
//! An offline-first synchronization engine for group trip data.
//!
//! Chat messages, tasks, calendar events and poll votes can be created,
//! updated and deleted while the device is disconnected. Mutations land in a
//! durable queue, are optimistically reflected in a local cache, and are
//! replayed against the remote backend once connectivity returns.
//!
//! ## Components
//!
//! - [`LocalStore`] - persistent key-value store with a queue table and a
//!   cache table. [`MemoryStore`] is the bundled implementation, optionally
//!   persisted as a JSON [`StoreSnapshot`].
//! - [`EntityCache`] - read-through cache keyed by `(entity type, entity id)`,
//!   scoped by trip, with a fixed TTL.
//! - [`SyncQueue`] - ordered log of pending mutations with status and retry
//!   bookkeeping.
//! - [`SyncProcessor`] - drains eligible queue entries oldest-first and routes
//!   each one through a [`HandlerTable`].
//! - [`ConflictResolver`] - bounded refetch-and-retry loop for
//!   optimistic-concurrency version conflicts.
//! - [`TripSync`] - facade choosing between the online and offline paths.
//!
//! ## Queue state machine
//!
//! ```text
//! pending -> syncing -> removed   (handler succeeded)
//!                    -> pending   (transient failure, retried with backoff)
//!                    -> failed    (retries exhausted)
//! failed  -> pending              (operator requeue only)
//! ```
//!
//! The `pending -> syncing` transition is an atomic compare-and-swap in the
//! store. It is the only thing preventing two overlapping processing passes
//! from handling the same entry.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use tripsync_engine::{
//!     EntityCache, EntityType, HandlerOutcome, HandlerRequest, HandlerTable, ManualClock,
//!     MemoryStore, NewOperation, OperationType, RemoteEntity, SyncConfig, SyncProcessor,
//!     SyncQueue,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(MemoryStore::new());
//! let clock = Arc::new(ManualClock::new(1_706_745_600_000));
//! let config = SyncConfig::default();
//!
//! let queue = SyncQueue::new(store.clone(), clock.clone(), &config);
//! let cache = EntityCache::new(store.clone(), clock.clone(), &config);
//!
//! // 1. Queue a mutation while offline
//! queue
//!     .enqueue(NewOperation::create(EntityType::Task, "trip-1", json!({"title": "Pack bags"})))
//!     .await
//!     .unwrap();
//!
//! // 2. Register a handler for the route
//! let mut handlers = HandlerTable::new();
//! handlers.register(EntityType::Task, OperationType::Create, |req: HandlerRequest| async move {
//!     Ok(HandlerOutcome::Entity(RemoteEntity::new(
//!         "srv-1",
//!         req.entity_type,
//!         req.trip_id,
//!         req.payload,
//!         1,
//!     )))
//! });
//!
//! // 3. Drain the queue once connectivity is back
//! let processor = SyncProcessor::new(queue.clone(), cache.clone(), handlers);
//! let summary = processor.process_pending().await.unwrap();
//! assert_eq!(summary.processed, 1);
//! assert!(cache.get(EntityType::Task, "srv-1").await.unwrap().is_some());
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod entity;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod operation;
pub mod processor;
pub mod queue;
pub mod record;
pub mod remote;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use cache::EntityCache;
pub use client::{MutationOutcome, TripSync};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use conflict::ConflictResolver;
pub use entity::{
    BaseCampPayload, CalendarEventPayload, ChatMessagePayload, EntityPayload, EntityType,
    PollVotePayload, TaskPayload,
};
pub use error::Error;
#[cfg(feature = "http")]
pub use http::HttpBackend;
pub use operation::{NewOperation, OperationType, QueueFilter, QueuedOperation, SyncStatus};
pub use processor::{
    Handler, HandlerOutcome, HandlerRequest, HandlerTable, ProcessSummary, Route, SyncProcessor,
    SyncWorker,
};
pub use queue::SyncQueue;
pub use record::CachedEntity;
pub use remote::{CreateEntityRequest, ErrorBody, RemoteBackend, RemoteEntity, UpdateEntityRequest};
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{LocalStore, MemoryStore};

/// Type aliases for clarity
pub type OperationId = String;
pub type EntityId = String;
pub type TripId = String;
pub type Version = u64;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
