//! Sync queue - the durable, ordered log of mutations awaiting replay.
//!
//! Every status transition goes through [`LocalStore::update_operation`], so
//! two processing passes can never both move the same entry out of `pending`.

use crate::{
    clock::{self, Clock},
    error::Result,
    store::LocalStore,
    EntityType, Error, NewOperation, OperationId, QueueFilter, QueuedOperation, SyncConfig,
    SyncStatus, Timestamp,
};
use std::sync::Arc;
use uuid::Uuid;

/// Handle to the queue table. Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    /// Backoff unit in milliseconds
    base_delay: Timestamp,
    max_retries: u32,
}

impl SyncQueue {
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>, config: &SyncConfig) -> Self {
        Self {
            store,
            clock,
            base_delay: clock::millis(config.base_delay),
            max_retries: config.max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Append a mutation as a fresh `pending` entry.
    ///
    /// Reserved entity types and updates/deletes without a target are
    /// rejected before anything is written.
    pub async fn enqueue(&self, op: NewOperation) -> Result<OperationId> {
        self.enqueue_as(Uuid::new_v4().to_string(), op).await
    }

    /// Enqueue under a caller-chosen id, e.g. one already sent to the backend
    /// as an idempotency key.
    pub(crate) async fn enqueue_as(&self, id: OperationId, op: NewOperation) -> Result<OperationId> {
        if !op.entity_type.is_syncable() {
            tracing::warn!(
                entity_type = %op.entity_type,
                trip_id = %op.trip_id,
                "Rejected offline mutation of reserved entity type"
            );
            return Err(Error::DisallowedEntityType(op.entity_type));
        }
        if op.operation_type.requires_entity_id() && op.entity_id.is_none() {
            return Err(Error::MissingEntityId {
                entity_type: op.entity_type,
                operation: op.operation_type,
            });
        }

        let queued = QueuedOperation::new(id.clone(), op, self.clock.now_millis());

        tracing::debug!(
            operation_id = %id,
            entity_type = %queued.entity_type,
            operation_type = %queued.operation_type,
            trip_id = %queued.trip_id,
            "Enqueued operation"
        );

        self.store.put_operation(queued).await?;
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueuedOperation>> {
        self.store.get_operation(id).await
    }

    /// Matching entries, oldest first. Ties on `enqueued_at` break by id.
    pub async fn list(&self, filter: QueueFilter) -> Result<Vec<QueuedOperation>> {
        let candidates = match filter.status {
            Some(status) => self.store.operations_by_status(status).await?,
            None => self.store.all_operations().await?,
        };

        let mut ops: Vec<_> = candidates
            .into_iter()
            .filter(|op| filter.matches(op))
            .collect();
        sort_oldest_first(&mut ops);
        Ok(ops)
    }

    /// Delete an entry. Returns false if it was already gone.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.store.delete_operation(id).await
    }

    /// Set the status, optionally counting one more failed attempt.
    ///
    /// Returns `None` when the entry no longer exists.
    pub async fn set_status(
        &self,
        id: &str,
        status: SyncStatus,
        increment_retry: bool,
    ) -> Result<Option<QueuedOperation>> {
        self.store
            .update_operation(id, &|op| {
                op.status = status;
                if increment_retry {
                    op.retry_count += 1;
                }
                true
            })
            .await
    }

    /// Atomically move an eligible entry from `pending` to `syncing`.
    ///
    /// Eligibility is checked again against the stored row, so a caller
    /// holding a stale candidate list cannot claim an entry that has since
    /// failed and is still backing off. Returns `None` if the entry is gone,
    /// another pass already claimed it, or it is not eligible right now.
    pub async fn claim(&self, id: &str) -> Result<Option<QueuedOperation>> {
        let now = self.clock.now_millis();
        self.store
            .update_operation(id, &|op| {
                if !self.is_eligible(op, now) {
                    return false;
                }
                op.status = SyncStatus::Syncing;
                true
            })
            .await
    }

    /// Point queued mutations that target `from` at `to` instead. Used once
    /// the server assigns the real id of an entity created offline.
    pub async fn rebind_entity(
        &self,
        entity_type: EntityType,
        from: &str,
        to: &str,
    ) -> Result<usize> {
        let mut rebound = 0;
        for op in self.store.all_operations().await? {
            if op.entity_type != entity_type || op.entity_id.as_deref() != Some(from) {
                continue;
            }
            let updated = self
                .store
                .update_operation(&op.id, &|op| {
                    if op.entity_id.as_deref() != Some(from) {
                        return false;
                    }
                    op.entity_id = Some(to.to_string());
                    true
                })
                .await?;
            if updated.is_some() {
                rebound += 1;
            }
        }

        if rebound > 0 {
            tracing::debug!(
                entity_type = %entity_type,
                from,
                to,
                rebound,
                "Rebound queued operations to server id"
            );
        }
        Ok(rebound)
    }

    /// Count one failed attempt.
    ///
    /// The entry goes back to `pending`, or to `failed` once the retry count
    /// reaches the ceiling.
    pub async fn record_failure(&self, id: &str) -> Result<Option<QueuedOperation>> {
        let max_retries = self.max_retries;
        self.store
            .update_operation(id, &|op| {
                op.retry_count += 1;
                op.status = if op.retry_count >= max_retries {
                    SyncStatus::Failed
                } else {
                    SyncStatus::Pending
                };
                true
            })
            .await
    }

    /// Operator retry of a `failed` entry: back to `pending`, immediately
    /// eligible. Returns `None` if the entry is missing or not failed.
    pub async fn requeue(&self, id: &str) -> Result<Option<QueuedOperation>> {
        let now = self.clock.now_millis();
        let requeued = self
            .store
            .update_operation(id, &|op| {
                if op.status != SyncStatus::Failed {
                    return false;
                }
                op.status = SyncStatus::Pending;
                op.retry_count = 0;
                op.enqueued_at = now;
                true
            })
            .await?;

        if requeued.is_some() {
            tracing::info!(operation_id = %id, "Requeued failed operation");
        }
        Ok(requeued)
    }

    /// Backoff before attempt `retry_count + 1`, in milliseconds.
    pub fn backoff(&self, retry_count: u32) -> Timestamp {
        self.base_delay.saturating_mul(Timestamp::from(retry_count))
    }

    /// Whether a single entry may be attempted at time `now`.
    pub fn is_eligible(&self, op: &QueuedOperation, now: Timestamp) -> bool {
        if op.status != SyncStatus::Pending {
            return false;
        }
        if op.retry_count == 0 {
            return true;
        }
        op.retry_count < self.max_retries
            && now.saturating_sub(op.enqueued_at) >= self.backoff(op.retry_count)
    }

    /// `pending` entries whose backoff has elapsed, oldest first.
    pub async fn eligible_for_retry(&self) -> Result<Vec<QueuedOperation>> {
        let now = self.clock.now_millis();
        let mut ops: Vec<_> = self
            .store
            .operations_by_status(SyncStatus::Pending)
            .await?
            .into_iter()
            .filter(|op| self.is_eligible(op, now))
            .collect();
        sort_oldest_first(&mut ops);
        Ok(ops)
    }

    /// Reset entries stranded in `syncing` by a crash. Call once at startup,
    /// before any pass runs.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for op in self.store.operations_by_status(SyncStatus::Syncing).await? {
            let reset = self
                .store
                .update_operation(&op.id, &|op| {
                    if op.status != SyncStatus::Syncing {
                        return false;
                    }
                    op.status = SyncStatus::Pending;
                    true
                })
                .await?;
            if reset.is_some() {
                recovered += 1;
            }
        }

        if recovered > 0 {
            tracing::info!(recovered, "Reset interrupted operations to pending");
        }
        Ok(recovered)
    }

    /// Total number of entries, whatever their status.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.all_operations().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self
            .store
            .operations_by_status(SyncStatus::Pending)
            .await?
            .len())
    }

    /// Entries that exhausted their retries, oldest first.
    pub async fn failed(&self) -> Result<Vec<QueuedOperation>> {
        self.list(QueueFilter::default().status(SyncStatus::Failed))
            .await
    }
}

fn sort_oldest_first(ops: &mut [QueuedOperation]) {
    ops.sort_by(|a, b| (a.enqueued_at, &a.id).cmp(&(b.enqueued_at, &b.id)));
}
