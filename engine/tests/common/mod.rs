//! Shared fixtures for integration tests: an in-process backend and a
//! client wired to it.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tripsync_engine::{
    EntityType, Error, LocalStore, ManualClock, MemoryStore, RemoteBackend, RemoteEntity,
    SyncConfig, TripSync, Version,
};

pub const START: u64 = 1_706_745_600_000;

#[derive(Default)]
struct State {
    entities: HashMap<(EntityType, String), RemoteEntity>,
    /// idempotency key -> entity id
    keys: HashMap<String, String>,
    next_id: u64,
}

/// Versioned entity server held in memory.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
    unreachable: AtomicBool,
    /// Commit the next create, then fail as if the response was lost
    drop_next_response: AtomicBool,
    /// Competing writes to apply before the next N updates
    interference: AtomicU32,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn drop_next_response(&self) {
        self.drop_next_response.store(true, Ordering::SeqCst);
    }

    pub fn interfere(&self, writes: u32) {
        self.interference.store(writes, Ordering::SeqCst);
    }

    pub fn insert(&self, entity: RemoteEntity) {
        self.state
            .lock()
            .unwrap()
            .entities
            .insert((entity.entity_type, entity.entity_id.clone()), entity);
    }

    pub fn entity(&self, entity_type: EntityType, entity_id: &str) -> Option<RemoteEntity> {
        self.state
            .lock()
            .unwrap()
            .entities
            .get(&(entity_type, entity_id.to_string()))
            .cloned()
    }

    pub fn count(&self, entity_type: EntityType) -> usize {
        self.state
            .lock()
            .unwrap()
            .entities
            .keys()
            .filter(|(t, _)| *t == entity_type)
            .count()
    }

    fn check_reachable(&self) -> Result<(), Error> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(Error::Remote("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteBackend for FakeBackend {
    async fn create(
        &self,
        entity_type: EntityType,
        trip_id: &str,
        payload: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> Result<RemoteEntity, Error> {
        self.check_reachable()?;
        self.creates.fetch_add(1, Ordering::SeqCst);

        let entity = {
            let mut state = self.state.lock().unwrap();
            let existing = idempotency_key
                .and_then(|key| state.keys.get(key).cloned())
                .and_then(|id| state.entities.get(&(entity_type, id)).cloned());

            match existing {
                Some(entity) => entity,
                None => {
                    state.next_id += 1;
                    let entity = RemoteEntity::new(
                        format!("srv-{}", state.next_id),
                        entity_type,
                        trip_id,
                        payload,
                        1,
                    );
                    if let Some(key) = idempotency_key {
                        state.keys.insert(key.to_string(), entity.entity_id.clone());
                    }
                    state
                        .entities
                        .insert((entity_type, entity.entity_id.clone()), entity.clone());
                    entity
                }
            }
        };

        if self.drop_next_response.swap(false, Ordering::SeqCst) {
            return Err(Error::Remote("connection reset".into()));
        }
        Ok(entity)
    }

    async fn update(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
        version: Version,
    ) -> Result<RemoteEntity, Error> {
        self.check_reachable()?;
        self.updates.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        let Some(entity) = state.entities.get_mut(&(entity_type, entity_id.to_string())) else {
            return Err(Error::EntityNotFound {
                entity_type,
                entity_id: entity_id.to_string(),
            });
        };

        let pending = self.interference.load(Ordering::SeqCst);
        if pending > 0 {
            self.interference.store(pending - 1, Ordering::SeqCst);
            entity.version += 1;
        }

        if entity.version != version {
            return Err(Error::VersionConflict {
                entity_type,
                entity_id: entity_id.to_string(),
                expected: version,
                actual: Some(entity.version),
            });
        }

        entity.version += 1;
        entity.data = payload;
        Ok(entity.clone())
    }

    async fn delete(&self, entity_type: EntityType, entity_id: &str) -> Result<(), Error> {
        self.check_reachable()?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .entities
            .remove(&(entity_type, entity_id.to_string()));
        Ok(())
    }

    async fn fetch(&self, entity_type: EntityType, entity_id: &str) -> Result<RemoteEntity, Error> {
        self.check_reachable()?;
        self.entity(entity_type, entity_id)
            .ok_or_else(|| Error::EntityNotFound {
                entity_type,
                entity_id: entity_id.to_string(),
            })
    }

    async fn list(&self, trip_id: &str, entity_type: EntityType) -> Result<Vec<RemoteEntity>, Error> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        let mut entities: Vec<_> = state
            .entities
            .values()
            .filter(|e| e.trip_id == trip_id && e.entity_type == entity_type)
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(entities)
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        conflict_retry_delay: Duration::ZERO,
        ..SyncConfig::default()
    }
}

pub struct Fixture {
    pub client: TripSync,
    pub backend: Arc<FakeBackend>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

pub async fn fixture() -> Fixture {
    fixture_with_store(Arc::new(MemoryStore::new())).await
}

pub async fn fixture_with_store(store: Arc<MemoryStore>) -> Fixture {
    let backend = FakeBackend::new();
    let clock = Arc::new(ManualClock::new(START));
    let local: Arc<dyn LocalStore> = store.clone();
    let client = TripSync::new(local, clock.clone(), backend.clone(), &test_config())
        .await
        .unwrap();
    Fixture {
        client,
        backend,
        store,
        clock,
    }
}
