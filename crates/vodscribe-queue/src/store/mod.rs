//! Persistence layer for batch jobs and queue items.
//!
//! The store is the single source of truth: every state transition is a
//! store write, and authorization (row-level isolation per owning user)
//! is enforced at this boundary.

pub mod memory;
pub mod models;
pub mod sqlite;

pub use memory::MemoryBatchStore;
pub use sqlite::{DbPool, SqlxBatchStore, init_pool, init_pool_with_size, run_migrations};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::queue::{BatchJob, ItemStatus, QueueItem};

/// Per-status item counts for one batch job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStatusCounts {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub retrying: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl ItemStatusCounts {
    /// Number of items that reached completed or failed.
    pub fn settled(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Durable record of batch jobs and their queue items.
///
/// Lookups for rows the calling user does not own surface as `NotFound`.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Persist a batch job together with its items.
    async fn create_batch(&self, batch: &BatchJob, items: &[QueueItem]) -> Result<()>;

    /// Fetch a batch job by id.
    async fn get_batch(&self, id: &str) -> Result<BatchJob>;

    /// Persist the full state of a batch job.
    async fn update_batch(&self, batch: &BatchJob) -> Result<()>;

    /// Delete a batch job and, by cascade, its items.
    async fn delete_batch(&self, id: &str) -> Result<()>;

    /// List batch jobs visible to the calling user, newest first.
    async fn list_batches(&self) -> Result<Vec<BatchJob>>;

    /// Fetch a queue item by id.
    async fn get_item(&self, id: &str) -> Result<QueueItem>;

    /// List all items of a batch in creation order.
    async fn list_items(&self, batch_id: &str) -> Result<Vec<QueueItem>>;

    /// List items eligible for dispatch (pending or retrying), ordered by
    /// priority descending, then creation time ascending.
    async fn list_eligible_items(&self, batch_id: &str) -> Result<Vec<QueueItem>>;

    /// Atomically claim an item for processing.
    ///
    /// Transitions the item to processing only if it is still pending or
    /// retrying, recording the start timestamp on first entry. Returns the
    /// claimed item, or `None` if it was no longer eligible (already
    /// claimed elsewhere, cancelled, or settled).
    async fn claim_item(&self, id: &str) -> Result<Option<QueueItem>>;

    /// Persist the full state of a queue item.
    async fn update_item(&self, item: &QueueItem) -> Result<()>;

    /// Persist the latest progress value and stage label for an item.
    async fn update_item_progress(
        &self,
        id: &str,
        progress: f32,
        stage: Option<&str>,
    ) -> Result<()>;

    /// Transition every item of a batch currently in one of `from` to `to`.
    /// Returns the number of items changed.
    async fn bulk_update_status(
        &self,
        batch_id: &str,
        from: &[ItemStatus],
        to: ItemStatus,
    ) -> Result<u64>;

    /// Reset all failed items of a batch back to pending, clearing the
    /// retry count, error, progress and attempt timestamps. Returns the
    /// number of items reset.
    async fn reset_failed_items(&self, batch_id: &str) -> Result<u64>;

    /// Count the items of a batch by status.
    async fn count_items(&self, batch_id: &str) -> Result<ItemStatusCounts>;

    /// Reset items stranded in processing (e.g. by a crash mid-run) back
    /// to pending, across all batches. Returns the number of items reset.
    async fn reset_orphaned_items(&self) -> Result<u64>;

    /// Delete terminal batches older than the retention window, cascading
    /// to their items. Returns the number of batches deleted.
    async fn purge_finished_batches(&self, retention_days: i64) -> Result<u64>;
}
