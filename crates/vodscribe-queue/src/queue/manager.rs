//! Queue manager: dispatch, retry scheduling and batch status aggregation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{BatchJob, BatchStatus, BatchSummary, ItemStatus, QueueItem};
use super::limiter::ConcurrencyLimiter;
use super::progress::ProgressHandle;
use super::registry::{ItemProcessor, ProcessorRegistry};
use super::retry::RetryPolicy;
use crate::store::{BatchStore, ItemStatusCounts};
use crate::{Error, Result};

/// Configuration for the queue manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueManagerConfig {
    /// Maximum queue items processed concurrently within one batch run.
    pub concurrency: usize,
    /// Backoff policy applied between retry attempts.
    pub retry: RetryPolicy,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            retry: RetryPolicy::default(),
        }
    }
}

/// Orchestrates batch processing: selects runnable items, dispatches them
/// to registered processors under the concurrency limit, drives the
/// per-item retry state machine and keeps the batch-level aggregate
/// status current.
///
/// The store is the single source of truth; the manager holds no
/// authoritative state beyond the concurrency limiter. Duplicate dispatch
/// is prevented by the store's conditional claim, so several managers may
/// safely share one store.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn BatchStore>,
    registry: Arc<ProcessorRegistry>,
    limiter: ConcurrencyLimiter,
    retry_policy: RetryPolicy,
    cancellation_token: CancellationToken,
}

impl QueueManager {
    /// Create a manager with the default configuration.
    pub fn new(store: Arc<dyn BatchStore>, registry: Arc<ProcessorRegistry>) -> Self {
        Self::with_config(store, registry, QueueManagerConfig::default())
    }

    /// Create a manager with a custom configuration.
    pub fn with_config(
        store: Arc<dyn BatchStore>,
        registry: Arc<ProcessorRegistry>,
        config: QueueManagerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            limiter: ConcurrencyLimiter::new(config.concurrency),
            retry_policy: config.retry,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Persist a new batch job together with its items.
    ///
    /// The item count is fixed here; dispatch is a separate step.
    pub async fn enqueue_batch(
        &self,
        mut batch: BatchJob,
        mut items: Vec<QueueItem>,
    ) -> Result<String> {
        for item in &mut items {
            item.batch_id = batch.id.clone();
        }
        batch.total_items = items.len() as u32;
        batch.status = BatchStatus::Pending;

        self.store.create_batch(&batch, &items).await?;
        info!(
            "Enqueued batch {} ({}) with {} items",
            batch.id,
            batch.job_type,
            items.len()
        );
        Ok(batch.id)
    }

    /// Dispatch all eligible items of a batch and wait for every dispatched
    /// processing attempt to settle.
    ///
    /// Eligible items (pending or retrying) are selected in priority order,
    /// then run concurrently up to the configured limit. Per-item failures
    /// are absorbed into the retry state machine; retries scheduled for the
    /// future are not awaited here. Systemic failures (missing processor,
    /// store outage) mark the batch failed and propagate.
    pub async fn start_processing(&self, batch_id: &str) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.status == BatchStatus::Paused {
            debug!("Batch {} is paused, skipping dispatch", batch_id);
            return Ok(());
        }

        let eligible = self.store.list_eligible_items(batch_id).await?;
        if eligible.is_empty() {
            debug!("Batch {} has no eligible items, nothing to do", batch_id);
            return Ok(());
        }

        info!(
            "Starting batch {} with {} eligible items (concurrency {})",
            batch_id,
            eligible.len(),
            self.limiter.limit()
        );

        match self.dispatch(batch, eligible).await {
            Ok(()) => self.refresh_batch_status(batch_id).await,
            Err(e) => {
                error!("Dispatch for batch {} aborted: {}", batch_id, e);
                self.mark_batch_failed(batch_id).await;
                Err(e)
            }
        }
    }

    async fn dispatch(&self, mut batch: BatchJob, items: Vec<QueueItem>) -> Result<()> {
        let processor = self
            .registry
            .get(&batch.job_type)
            .ok_or_else(|| Error::UnregisteredProcessor(batch.job_type.clone()))?;
        processor.validate_config(&batch.config)?;

        batch.status = BatchStatus::Processing;
        if batch.started_at.is_none() {
            batch.started_at = Some(Utc::now());
        }
        self.store.update_batch(&batch).await?;

        let mut attempts = JoinSet::new();
        for item in items {
            let permit = self.limiter.acquire().await?;
            let manager = self.clone();
            let processor = processor.clone();
            attempts.spawn(async move {
                let _permit = permit;
                manager.run_attempt(&item.id, processor).await
            });
        }

        let mut first_error: Option<Error> = None;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error
                        .get_or_insert_with(|| Error::Other(format!("Attempt task failed: {}", e)));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run one processing attempt for an item.
    ///
    /// Returns `Err` only for store-level failures; processor outcomes are
    /// converted into item state transitions.
    async fn run_attempt(&self, item_id: &str, processor: Arc<dyn ItemProcessor>) -> Result<()> {
        let Some(item) = self.store.claim_item(item_id).await? else {
            debug!("Item {} no longer eligible, skipping", item_id);
            return Ok(());
        };

        debug!(
            "Processing item {} (attempt {} of {})",
            item.id,
            item.retry_count + 1,
            item.max_retries + 1
        );

        let progress = ProgressHandle::new(item.id.clone(), self.store.clone());
        let outcome = processor.process(&item, progress).await;

        // Re-read the item so progress reported during the attempt is not
        // clobbered by the outcome write.
        let current = self.store.get_item(&item.id).await?;
        match outcome {
            Ok(()) => self.complete_item(current).await,
            Err(e) => {
                self.handle_item_failure(current, processor, &e.to_string())
                    .await
            }
        }
    }

    async fn complete_item(&self, mut item: QueueItem) -> Result<()> {
        item.status = ItemStatus::Completed;
        item.progress = 100.0;
        item.completed_at = Some(Utc::now());
        self.store.update_item(&item).await?;
        info!("Item {} completed", item.id);
        Ok(())
    }

    async fn handle_item_failure(
        &self,
        mut item: QueueItem,
        processor: Arc<dyn ItemProcessor>,
        error: &str,
    ) -> Result<()> {
        if item.can_retry() {
            item.retry_count += 1;
            item.status = ItemStatus::Retrying;
            item.error = Some(error.to_string());
            self.store.update_item(&item).await?;

            let delay = self.retry_policy.delay_for_attempt(item.retry_count);
            warn!(
                "Item {} failed (attempt {}): {}; retrying in {:?}",
                item.id, item.retry_count, error, delay
            );
            self.schedule_retry(item, processor, delay);
        } else {
            item.status = ItemStatus::Failed;
            item.error = Some(error.to_string());
            item.completed_at = Some(Utc::now());
            self.store.update_item(&item).await?;
            warn!(
                "Item {} failed permanently after {} retries: {}",
                item.id, item.retry_count, error
            );
        }
        Ok(())
    }

    /// Schedule a retry attempt without blocking the dispatcher.
    ///
    /// The delayed task re-acquires a concurrency permit and goes through
    /// the same conditional claim as first attempts, so an item cancelled
    /// while waiting is skipped. On shutdown the timer is dropped; the item
    /// stays retrying in the store and a later dispatch pass picks it up.
    fn schedule_retry(&self, item: QueueItem, processor: Arc<dyn ItemProcessor>, delay: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = manager.cancellation_token.cancelled() => {
                    debug!("Shutdown before retry of item {}, leaving it queued", item.id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match manager.store.get_batch(&item.batch_id).await {
                Ok(batch) if batch.status == BatchStatus::Paused => {
                    debug!(
                        "Batch {} is paused, leaving item {} queued",
                        item.batch_id, item.id
                    );
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(
                        "Retry of item {} dropped, batch {} unavailable: {}",
                        item.id, item.batch_id, e
                    );
                    return;
                }
            }

            let permit = match manager.limiter.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Retry of item {} could not acquire a slot: {}", item.id, e);
                    return;
                }
            };

            let outcome = manager.run_attempt(&item.id, processor).await;
            drop(permit);

            if let Err(e) = outcome {
                error!("Retry attempt for item {} failed at the store: {}", item.id, e);
                manager.mark_batch_failed(&item.batch_id).await;
                return;
            }

            if let Err(e) = manager.refresh_batch_status(&item.batch_id).await {
                error!(
                    "Failed to refresh batch {} after retry of item {}: {}",
                    item.batch_id, item.id, e
                );
            }
        });
    }

    /// Halt future dispatch for a batch. In-flight items finish naturally,
    /// queue item state is left untouched, and scheduled retries are
    /// deferred until the batch is resumed.
    pub async fn pause_batch_job(&self, batch_id: &str) -> Result<BatchJob> {
        let mut batch = self.store.get_batch(batch_id).await?;
        if !matches!(
            batch.status,
            BatchStatus::Pending | BatchStatus::Processing
        ) {
            return Err(Error::InvalidStateTransition {
                from: batch.status.as_str().to_string(),
                to: BatchStatus::Paused.as_str().to_string(),
            });
        }

        batch.status = BatchStatus::Paused;
        self.store.update_batch(&batch).await?;
        info!("Batch {} paused", batch_id);
        Ok(batch)
    }

    /// Resume a paused batch and re-run the dispatch pass.
    pub async fn resume_batch_job(&self, batch_id: &str) -> Result<()> {
        let mut batch = self.store.get_batch(batch_id).await?;
        if batch.status != BatchStatus::Paused {
            return Err(Error::InvalidStateTransition {
                from: batch.status.as_str().to_string(),
                to: BatchStatus::Processing.as_str().to_string(),
            });
        }

        batch.status = BatchStatus::Processing;
        self.store.update_batch(&batch).await?;
        info!("Batch {} resumed", batch_id);

        self.start_processing(batch_id).await?;
        // Items that settled while the batch was paused are folded into the
        // aggregate now that the pause is lifted.
        self.refresh_batch_status(batch_id).await
    }

    /// Cancel a batch: pending and retrying items are cancelled in bulk,
    /// items already processing finish naturally. Their outcome is still
    /// recorded but the batch status stays cancelled.
    pub async fn cancel_batch_job(&self, batch_id: &str) -> Result<BatchJob> {
        let mut batch = self.store.get_batch(batch_id).await?;
        if batch.status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: batch.status.as_str().to_string(),
                to: BatchStatus::Cancelled.as_str().to_string(),
            });
        }

        batch.status = BatchStatus::Cancelled;
        if batch.completed_at.is_none() {
            batch.completed_at = Some(Utc::now());
        }
        self.store.update_batch(&batch).await?;

        let cancelled = self
            .store
            .bulk_update_status(
                batch_id,
                &[ItemStatus::Pending, ItemStatus::Retrying],
                ItemStatus::Cancelled,
            )
            .await?;

        info!("Batch {} cancelled ({} queued items)", batch_id, cancelled);
        Ok(batch)
    }

    /// Move all failed items of a batch back to pending, resetting their
    /// retry count and clearing the recorded error. Does not start
    /// processing; call [`QueueManager::start_processing`] afterwards.
    pub async fn retry_failed_items(&self, batch_id: &str) -> Result<u64> {
        self.store.get_batch(batch_id).await?;
        let reset = self.store.reset_failed_items(batch_id).await?;
        info!("Reset {} failed items of batch {}", reset, batch_id);
        Ok(reset)
    }

    /// Recompute the batch aggregate from its items and persist it.
    ///
    /// A cancelled or paused batch keeps its status (only the counts are
    /// refreshed); start and completion timestamps are recorded the first
    /// time the corresponding status is reached.
    pub async fn refresh_batch_status(&self, batch_id: &str) -> Result<()> {
        let mut batch = self.store.get_batch(batch_id).await?;
        let counts = self.store.count_items(batch_id).await?;

        batch.completed_items = counts.completed as u32;
        batch.failed_items = counts.failed as u32;

        if !matches!(batch.status, BatchStatus::Cancelled | BatchStatus::Paused) {
            let status = if counts.settled() == counts.total && counts.total > 0 {
                if counts.failed == 0 {
                    BatchStatus::Completed
                } else {
                    BatchStatus::Failed
                }
            } else if counts.completed > 0 || counts.failed > 0 {
                BatchStatus::Processing
            } else {
                BatchStatus::Pending
            };

            if status == BatchStatus::Processing && batch.started_at.is_none() {
                batch.started_at = Some(Utc::now());
            }
            if status.is_terminal() && batch.completed_at.is_none() {
                batch.completed_at = Some(Utc::now());
            }
            batch.status = status;
        }

        self.store.update_batch(&batch).await
    }

    async fn mark_batch_failed(&self, batch_id: &str) {
        match self.store.get_batch(batch_id).await {
            Ok(mut batch) => {
                batch.status = BatchStatus::Failed;
                if batch.completed_at.is_none() {
                    batch.completed_at = Some(Utc::now());
                }
                if let Err(e) = self.store.update_batch(&batch).await {
                    error!("Failed to mark batch {} as failed: {}", batch_id, e);
                }
            }
            Err(e) => error!("Failed to load batch {} to mark it failed: {}", batch_id, e),
        }
    }

    /// Aggregate read-side view of a batch.
    pub async fn batch_summary(&self, batch_id: &str) -> Result<BatchSummary> {
        let batch = self.store.get_batch(batch_id).await?;
        Ok(BatchSummary::from(&batch))
    }

    /// Summaries of every batch visible to the calling user.
    pub async fn list_batch_summaries(&self) -> Result<Vec<BatchSummary>> {
        let batches = self.store.list_batches().await?;
        Ok(batches.iter().map(BatchSummary::from).collect())
    }

    /// Per-status item counts for a batch.
    pub async fn item_stats(&self, batch_id: &str) -> Result<ItemStatusCounts> {
        self.store.get_batch(batch_id).await?;
        self.store.count_items(batch_id).await
    }

    /// All items of a batch, in creation order.
    pub async fn batch_items(&self, batch_id: &str) -> Result<Vec<QueueItem>> {
        self.store.get_batch(batch_id).await?;
        self.store.list_items(batch_id).await
    }

    /// One item with its progress, stage and error detail.
    pub async fn get_item(&self, item_id: &str) -> Result<QueueItem> {
        self.store.get_item(item_id).await
    }

    /// Delete a terminal batch together with its items.
    pub async fn delete_batch_job(&self, batch_id: &str) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if !batch.status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: batch.status.as_str().to_string(),
                to: "DELETED".to_string(),
            });
        }
        self.store.delete_batch(batch_id).await?;
        info!("Batch {} deleted", batch_id);
        Ok(())
    }

    /// Reset items stranded in processing by a previous run (e.g. after a
    /// crash) back to pending. Call once at startup before dispatching.
    pub async fn recover(&self) -> Result<u64> {
        let reset = self.store.reset_orphaned_items().await?;
        if reset > 0 {
            info!("Reset {} orphaned processing items to pending", reset);
        }
        Ok(reset)
    }

    /// Delete terminal batches that finished before the retention window,
    /// cascading to their items.
    pub async fn purge_finished_batches(&self, retention_days: i64) -> Result<u64> {
        let purged = self.store.purge_finished_batches(retention_days).await?;
        if purged > 0 {
            info!(
                "Purged {} finished batches older than {} days",
                purged, retention_days
            );
        }
        Ok(purged)
    }

    /// Stop scheduled retry timers cooperatively. Items whose timers are
    /// dropped stay retrying in the store and are picked up by a later
    /// dispatch pass.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }
}
