//! Integration tests for the SQLite store.
//!
//! These use a real in-memory SQLite database (single connection, so all
//! queries see the same schema) with the embedded migrations applied.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::FutureExt;
use vodscribe_queue::store::{init_pool_with_size, run_migrations};
use vodscribe_queue::{
    BatchJob, BatchStatus, BatchStore, ItemStatus, ProcessorRegistry, QueueItem, QueueManager,
    SqlxBatchStore,
};

async fn setup_store() -> SqlxBatchStore {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let pool = init_pool_with_size("sqlite::memory:", 1)
        .await
        .expect("Failed to create test pool");
    run_migrations(&pool).await.expect("Failed to run migrations");
    SqlxBatchStore::new(pool)
}

fn batch_with_items(count: usize) -> (BatchJob, Vec<QueueItem>) {
    let mut batch = BatchJob::new("user-1", "uploads", "transcribe");
    batch.total_items = count as u32;
    let base = batch.created_at;
    let items = (0..count)
        .map(|i| {
            let mut item = QueueItem::new(&batch.id);
            item.created_at = base + Duration::milliseconds(i as i64);
            item
        })
        .collect();
    (batch, items)
}

#[tokio::test]
async fn test_create_and_read_back() {
    let store = setup_store().await;
    let (batch, items) = batch_with_items(2);
    let batch = batch.with_config(serde_json::json!({"language": "en"}));
    store.create_batch(&batch, &items).await.unwrap();

    let loaded = store.get_batch(&batch.id).await.unwrap();
    assert_eq!(loaded.name, "uploads");
    assert_eq!(loaded.job_type, "transcribe");
    assert_eq!(loaded.status, BatchStatus::Pending);
    assert_eq!(loaded.total_items, 2);
    assert_eq!(loaded.config["language"], "en");

    let listed = store.list_items(&batch.id).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, items[0].id);
    assert_eq!(listed[1].id, items[1].id);
}

#[tokio::test]
async fn test_missing_batch_is_not_found() {
    let store = setup_store().await;
    let err = store.get_batch("missing").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_eligible_ordering() {
    let store = setup_store().await;
    let (batch, mut items) = batch_with_items(3);
    items[0].priority = 5;
    items[1].priority = 1;
    items[2].priority = 5;
    store.create_batch(&batch, &items).await.unwrap();

    let eligible = store.list_eligible_items(&batch.id).await.unwrap();
    let order: Vec<String> = eligible.into_iter().map(|item| item.id).collect();
    assert_eq!(
        order,
        vec![items[0].id.clone(), items[2].id.clone(), items[1].id.clone()]
    );
}

#[tokio::test]
async fn test_claim_is_conditional() {
    let store = setup_store().await;
    let (batch, items) = batch_with_items(1);
    let item_id = items[0].id.clone();
    store.create_batch(&batch, &items).await.unwrap();

    let claimed = store.claim_item(&item_id).await.unwrap().unwrap();
    assert_eq!(claimed.status, ItemStatus::Processing);
    assert!(claimed.started_at.is_some());

    // A second claim must lose.
    assert!(store.claim_item(&item_id).await.unwrap().is_none());

    // Settled items cannot be claimed either.
    let mut settled = claimed.clone();
    settled.status = ItemStatus::Completed;
    settled.completed_at = Some(Utc::now());
    store.update_item(&settled).await.unwrap();
    assert!(store.claim_item(&item_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_bulk_update_and_counts() {
    let store = setup_store().await;
    let (batch, mut items) = batch_with_items(3);
    items[2].status = ItemStatus::Retrying;
    store.create_batch(&batch, &items).await.unwrap();

    let changed = store
        .bulk_update_status(
            &batch.id,
            &[ItemStatus::Pending, ItemStatus::Retrying],
            ItemStatus::Cancelled,
        )
        .await
        .unwrap();
    assert_eq!(changed, 3);

    let counts = store.count_items(&batch.id).await.unwrap();
    assert_eq!(counts.total, 3);
    assert_eq!(counts.cancelled, 3);
    assert_eq!(counts.pending, 0);

    // Terminal bulk transitions record a completion timestamp.
    for item in store.list_items(&batch.id).await.unwrap() {
        assert!(item.completed_at.is_some());
    }
}

#[tokio::test]
async fn test_reset_failed_items() {
    let store = setup_store().await;
    let (batch, mut items) = batch_with_items(2);
    items[0].status = ItemStatus::Failed;
    items[0].retry_count = 3;
    items[0].error = Some("decode failed".to_string());
    items[0].progress = 60.0;
    items[1].status = ItemStatus::Completed;
    store.create_batch(&batch, &items).await.unwrap();

    let reset = store.reset_failed_items(&batch.id).await.unwrap();
    assert_eq!(reset, 1);

    let item = store.get_item(&items[0].id).await.unwrap();
    assert_eq!(item.status, ItemStatus::Pending);
    assert_eq!(item.retry_count, 0);
    assert!(item.error.is_none());
    assert_eq!(item.progress, 0.0);
    assert!(item.started_at.is_none());

    // The completed item is untouched.
    let untouched = store.get_item(&items[1].id).await.unwrap();
    assert_eq!(untouched.status, ItemStatus::Completed);
}

#[tokio::test]
async fn test_owner_scoping() {
    let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
    run_migrations(&pool).await.unwrap();

    let unscoped = SqlxBatchStore::new(pool.clone());
    let (batch, items) = batch_with_items(1);
    unscoped.create_batch(&batch, &items).await.unwrap();

    let theirs = SqlxBatchStore::scoped(pool.clone(), "user-2");
    assert!(theirs.get_batch(&batch.id).await.unwrap_err().is_not_found());
    assert!(theirs.get_item(&items[0].id).await.unwrap_err().is_not_found());
    assert!(theirs.claim_item(&items[0].id).await.unwrap().is_none());
    assert!(theirs.list_batches().await.unwrap().is_empty());

    let mine = SqlxBatchStore::scoped(pool, "user-1");
    assert_eq!(mine.get_batch(&batch.id).await.unwrap().id, batch.id);
    assert_eq!(mine.list_batches().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_cascades_to_items() {
    let store = setup_store().await;
    let (batch, items) = batch_with_items(2);
    store.create_batch(&batch, &items).await.unwrap();

    store.delete_batch(&batch.id).await.unwrap();
    assert!(store.get_batch(&batch.id).await.unwrap_err().is_not_found());
    assert!(store.get_item(&items[0].id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_reset_orphaned_items() {
    let store = setup_store().await;
    let (batch, mut items) = batch_with_items(2);
    items[0].status = ItemStatus::Processing;
    store.create_batch(&batch, &items).await.unwrap();

    let reset = store.reset_orphaned_items().await.unwrap();
    assert_eq!(reset, 1);
    assert_eq!(store.list_eligible_items(&batch.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_purge_respects_retention() {
    let store = setup_store().await;

    let (mut old, old_items) = batch_with_items(1);
    old.status = BatchStatus::Completed;
    old.completed_at = Some(Utc::now() - Duration::days(40));
    store.create_batch(&old, &old_items).await.unwrap();

    let (mut recent, recent_items) = batch_with_items(1);
    recent.status = BatchStatus::Completed;
    recent.completed_at = Some(Utc::now() - Duration::days(5));
    store.create_batch(&recent, &recent_items).await.unwrap();

    let purged = store.purge_finished_batches(30).await.unwrap();
    assert_eq!(purged, 1);
    assert!(store.get_batch(&old.id).await.unwrap_err().is_not_found());
    assert!(store.get_item(&old_items[0].id).await.unwrap_err().is_not_found());
    assert_eq!(store.get_batch(&recent.id).await.unwrap().id, recent.id);
}

#[tokio::test]
async fn test_manager_end_to_end_on_sqlite() {
    let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
    run_migrations(&pool).await.unwrap();
    let store = Arc::new(SqlxBatchStore::new(pool));

    let registry = Arc::new(ProcessorRegistry::new());
    registry
        .register_fn("transcribe", |_item, progress| {
            async move {
                progress.update(50.0, Some("transcribing")).await?;
                Ok(())
            }
            .boxed()
        })
        .unwrap();

    let manager = QueueManager::new(store.clone(), registry);
    let (batch, items) = batch_with_items(2);
    let batch_id = manager.enqueue_batch(batch, items).await.unwrap();
    manager.start_processing(&batch_id).await.unwrap();

    let batch = store.get_batch(&batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_items, 2);
    for item in store.list_items(&batch_id).await.unwrap() {
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.progress, 100.0);
        assert_eq!(item.stage.as_deref(), Some("transcribing"));
    }
}
