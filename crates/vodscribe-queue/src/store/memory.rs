//! In-memory store implementation.
//!
//! Backs tests and embedded callers that do not need durability. A single
//! lock guards both maps so conditional claims stay atomic.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{BatchStore, ItemStatusCounts};
use crate::queue::{BatchJob, ItemStatus, QueueItem};
use crate::{Error, Result};

#[derive(Default)]
struct State {
    batches: HashMap<String, BatchJob>,
    items: HashMap<String, QueueItem>,
}

/// Lock-protected in-memory [`BatchStore`].
#[derive(Default)]
pub struct MemoryBatchStore {
    state: RwLock<State>,
    owner_id: Option<String>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope the store to one owning user; rows of other owners surface
    /// as not found.
    pub fn with_owner(owner_id: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            owner_id: Some(owner_id.into()),
        }
    }

    fn owns(&self, batch: &BatchJob) -> bool {
        self.owner_id
            .as_deref()
            .map(|owner| owner == batch.owner_id)
            .unwrap_or(true)
    }

    fn visible_batch<'a>(&self, state: &'a State, id: &str) -> Option<&'a BatchJob> {
        state.batches.get(id).filter(|batch| self.owns(batch))
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn create_batch(&self, batch: &BatchJob, items: &[QueueItem]) -> Result<()> {
        let mut state = self.state.write();
        state.batches.insert(batch.id.clone(), batch.clone());
        for item in items {
            state.items.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<BatchJob> {
        let state = self.state.read();
        self.visible_batch(&state, id)
            .cloned()
            .ok_or_else(|| Error::not_found("BatchJob", id))
    }

    async fn update_batch(&self, batch: &BatchJob) -> Result<()> {
        let mut state = self.state.write();
        if self.visible_batch(&state, &batch.id).is_none() {
            return Err(Error::not_found("BatchJob", &batch.id));
        }
        state.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn delete_batch(&self, id: &str) -> Result<()> {
        let mut state = self.state.write();
        if self.visible_batch(&state, id).is_none() {
            return Err(Error::not_found("BatchJob", id));
        }
        state.batches.remove(id);
        state.items.retain(|_, item| item.batch_id != id);
        Ok(())
    }

    async fn list_batches(&self) -> Result<Vec<BatchJob>> {
        let state = self.state.read();
        let mut batches: Vec<BatchJob> = state
            .batches
            .values()
            .filter(|batch| self.owns(batch))
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(batches)
    }

    async fn get_item(&self, id: &str) -> Result<QueueItem> {
        let state = self.state.read();
        state
            .items
            .get(id)
            .filter(|item| self.visible_batch(&state, &item.batch_id).is_some())
            .cloned()
            .ok_or_else(|| Error::not_found("QueueItem", id))
    }

    async fn list_items(&self, batch_id: &str) -> Result<Vec<QueueItem>> {
        let state = self.state.read();
        let mut items: Vec<QueueItem> = state
            .items
            .values()
            .filter(|item| item.batch_id == batch_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn list_eligible_items(&self, batch_id: &str) -> Result<Vec<QueueItem>> {
        let state = self.state.read();
        if self.visible_batch(&state, batch_id).is_none() {
            return Ok(Vec::new());
        }
        let mut items: Vec<QueueItem> = state
            .items
            .values()
            .filter(|item| item.batch_id == batch_id && item.status.is_eligible())
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(items)
    }

    async fn claim_item(&self, id: &str) -> Result<Option<QueueItem>> {
        let mut state = self.state.write();
        let visible = state
            .items
            .get(id)
            .map(|item| item.batch_id.clone())
            .is_some_and(|batch_id| self.visible_batch(&state, &batch_id).is_some());
        if !visible {
            return Ok(None);
        }
        let Some(item) = state.items.get_mut(id) else {
            return Ok(None);
        };
        if !item.status.is_eligible() {
            return Ok(None);
        }
        item.status = ItemStatus::Processing;
        if item.started_at.is_none() {
            item.started_at = Some(Utc::now());
        }
        Ok(Some(item.clone()))
    }

    async fn update_item(&self, item: &QueueItem) -> Result<()> {
        let mut state = self.state.write();
        if !state.items.contains_key(&item.id) {
            return Err(Error::not_found("QueueItem", &item.id));
        }
        state.items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn update_item_progress(
        &self,
        id: &str,
        progress: f32,
        stage: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| Error::not_found("QueueItem", id))?;
        item.progress = progress.clamp(0.0, 100.0);
        if let Some(stage) = stage {
            item.stage = Some(stage.to_string());
        }
        Ok(())
    }

    async fn bulk_update_status(
        &self,
        batch_id: &str,
        from: &[ItemStatus],
        to: ItemStatus,
    ) -> Result<u64> {
        let mut state = self.state.write();
        let now = Utc::now();
        let mut changed = 0;
        for item in state.items.values_mut() {
            if item.batch_id == batch_id && from.contains(&item.status) {
                item.status = to;
                if to.is_terminal() && item.completed_at.is_none() {
                    item.completed_at = Some(now);
                }
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn reset_failed_items(&self, batch_id: &str) -> Result<u64> {
        let mut state = self.state.write();
        let mut reset = 0;
        for item in state.items.values_mut() {
            if item.batch_id == batch_id && item.status == ItemStatus::Failed {
                item.status = ItemStatus::Pending;
                item.retry_count = 0;
                item.error = None;
                item.progress = 0.0;
                item.stage = None;
                item.started_at = None;
                item.completed_at = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn count_items(&self, batch_id: &str) -> Result<ItemStatusCounts> {
        let state = self.state.read();
        let mut counts = ItemStatusCounts::default();
        for item in state.items.values() {
            if item.batch_id != batch_id {
                continue;
            }
            counts.total += 1;
            match item.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Processing => counts.processing += 1,
                ItemStatus::Retrying => counts.retrying += 1,
                ItemStatus::Completed => counts.completed += 1,
                ItemStatus::Failed => counts.failed += 1,
                ItemStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    async fn reset_orphaned_items(&self) -> Result<u64> {
        let mut state = self.state.write();
        let visible: Vec<String> = state
            .batches
            .values()
            .filter(|batch| self.owns(batch))
            .map(|batch| batch.id.clone())
            .collect();
        let mut reset = 0;
        for item in state.items.values_mut() {
            if item.status == ItemStatus::Processing && visible.contains(&item.batch_id) {
                item.status = ItemStatus::Pending;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn purge_finished_batches(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let mut state = self.state.write();
        let stale: Vec<String> = state
            .batches
            .values()
            .filter(|batch| {
                self.owns(batch)
                    && batch.status.is_terminal()
                    && batch.completed_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .map(|batch| batch.id.clone())
            .collect();
        for id in &stale {
            state.batches.remove(id);
            state.items.retain(|_, item| &item.batch_id != id);
        }
        Ok(stale.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryBatchStore::new();
        let batch = BatchJob::new("user-1", "uploads", "transcribe");
        let item = QueueItem::new(&batch.id);
        let item_id = item.id.clone();
        store.create_batch(&batch, &[item]).await.unwrap();

        let first = store.claim_item(&item_id).await.unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().status, ItemStatus::Processing);

        let second = store.claim_item(&item_id).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_owner_scoping() {
        let store = MemoryBatchStore::with_owner("user-1");
        let theirs = BatchJob::new("user-2", "other", "transcribe");
        store.create_batch(&theirs, &[]).await.unwrap();

        let err = store.get_batch(&theirs.id).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
