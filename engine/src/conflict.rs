//! Conflict resolver - bounded refetch-and-retry for optimistic-concurrency
//! writes.
//!
//! A write carries the version the caller last saw. When the server answers
//! with a version conflict, the resolver waits a fixed delay, refetches the
//! current version and tries again. Running out of attempts yields
//! [`Error::ModifiedByAnotherUser`]; the write is never silently dropped or
//! forced through.

use crate::{
    error::Result, remote::RemoteBackend, EntityType, Error, RemoteEntity, SyncConfig, Version,
};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictResolver {
    max_attempts: u32,
    retry_delay: Duration,
}

impl ConflictResolver {
    /// `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.conflict_max_attempts, config.conflict_retry_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `mutate` with `version`, refetching and retrying on conflicts.
    ///
    /// Any error other than a version conflict, including one from
    /// `refetch`, ends the loop immediately.
    pub async fn run<T, M, MFut, R, RFut>(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        version: Version,
        mut refetch: R,
        mut mutate: M,
    ) -> Result<T>
    where
        M: FnMut(Version) -> MFut,
        MFut: Future<Output = Result<T>>,
        R: FnMut() -> RFut,
        RFut: Future<Output = Result<Version>>,
    {
        let mut version = version;
        let mut attempt = 1;

        loop {
            match mutate(version).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_version_conflict() => {
                    if attempt >= self.max_attempts {
                        tracing::error!(
                            entity_type = %entity_type,
                            entity_id,
                            attempts = attempt,
                            "Giving up on conflicting write"
                        );
                        return Err(Error::ModifiedByAnotherUser {
                            entity_type,
                            entity_id: entity_id.to_string(),
                            attempts: attempt,
                        });
                    }

                    tracing::warn!(
                        entity_type = %entity_type,
                        entity_id,
                        attempt,
                        stale_version = version,
                        "Version conflict, refetching"
                    );

                    tokio::time::sleep(self.retry_delay).await;
                    version = refetch().await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Update an entity through `backend`, resolving version conflicts.
    ///
    /// Without a `known_version` the current version is fetched first.
    pub async fn update(
        &self,
        backend: &dyn RemoteBackend,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
        known_version: Option<Version>,
    ) -> Result<RemoteEntity> {
        let version = match known_version {
            Some(version) => version,
            None => backend.fetch(entity_type, entity_id).await?.version,
        };

        self.run(
            entity_type,
            entity_id,
            version,
            || async move {
                backend
                    .fetch(entity_type, entity_id)
                    .await
                    .map(|entity| entity.version)
            },
            |version| {
                let payload = payload.clone();
                async move {
                    backend
                        .update(entity_type, entity_id, payload, version)
                        .await
                }
            },
        )
        .await
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}
