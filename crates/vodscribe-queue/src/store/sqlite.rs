//! SQLite store implementation using sqlx.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration as StdDuration;

use super::models::{BatchJobRow, QueueItemRow};
use super::{BatchStore, ItemStatusCounts};
use crate::queue::{BatchJob, BatchStatus, ItemStatus, QueueItem};
use crate::{Error, Result};

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 5;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Initialize the database connection pool with WAL mode enabled.
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> std::result::Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(StdDuration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(StdDuration::from_secs(30))
        .connect_with(connect_options)
        .await?;

    tracing::info!(
        "Database pool initialized with WAL mode, {} max connections",
        max_connections
    );

    Ok(pool)
}

/// Initialize the database connection pool with the default size.
pub async fn init_pool(database_url: &str) -> std::result::Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, DEFAULT_POOL_SIZE).await
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &DbPool) -> std::result::Result<(), sqlx::Error> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// SQLite-backed [`BatchStore`].
///
/// A handle may be scoped to one owning user, in which case every query
/// filters on the owner column and cross-owner rows surface as not found.
pub struct SqlxBatchStore {
    pool: DbPool,
    owner_id: Option<String>,
}

impl SqlxBatchStore {
    /// Create an unscoped store (trusted internal callers).
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            owner_id: None,
        }
    }

    /// Create a store scoped to one owning user.
    pub fn scoped(pool: DbPool, owner_id: impl Into<String>) -> Self {
        Self {
            pool,
            owner_id: Some(owner_id.into()),
        }
    }

    fn owner(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }
}

fn status_placeholders(statuses: &[ItemStatus]) -> String {
    statuses
        .iter()
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl BatchStore for SqlxBatchStore {
    async fn create_batch(&self, batch: &BatchJob, items: &[QueueItem]) -> Result<()> {
        let row = BatchJobRow::from_batch(batch);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO batch_jobs
                (id, owner_id, name, job_type, config, status,
                 total_items, completed_items, failed_items,
                 created_at, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.owner_id)
        .bind(&row.name)
        .bind(&row.job_type)
        .bind(&row.config)
        .bind(&row.status)
        .bind(row.total_items)
        .bind(row.completed_items)
        .bind(row.failed_items)
        .bind(&row.created_at)
        .bind(&row.started_at)
        .bind(&row.completed_at)
        .execute(&mut *tx)
        .await?;

        for item in items {
            let row = QueueItemRow::from_item(item);
            sqlx::query(
                r#"
                INSERT INTO queue_items
                    (id, batch_id, source_id, priority, status,
                     retry_count, max_retries, error, progress, stage, metadata,
                     created_at, started_at, completed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(&row.batch_id)
            .bind(&row.source_id)
            .bind(row.priority)
            .bind(&row.status)
            .bind(row.retry_count)
            .bind(row.max_retries)
            .bind(&row.error)
            .bind(row.progress)
            .bind(&row.stage)
            .bind(&row.metadata)
            .bind(&row.created_at)
            .bind(&row.started_at)
            .bind(&row.completed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<BatchJob> {
        sqlx::query_as::<_, BatchJobRow>(
            "SELECT * FROM batch_jobs WHERE id = ? AND (? IS NULL OR owner_id = ?)",
        )
        .bind(id)
        .bind(self.owner())
        .bind(self.owner())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.to_batch())
        .ok_or_else(|| Error::not_found("BatchJob", id))
    }

    async fn update_batch(&self, batch: &BatchJob) -> Result<()> {
        let row = BatchJobRow::from_batch(batch);
        let result = sqlx::query(
            r#"
            UPDATE batch_jobs SET
                name = ?,
                job_type = ?,
                config = ?,
                status = ?,
                total_items = ?,
                completed_items = ?,
                failed_items = ?,
                started_at = ?,
                completed_at = ?
            WHERE id = ? AND (? IS NULL OR owner_id = ?)
            "#,
        )
        .bind(&row.name)
        .bind(&row.job_type)
        .bind(&row.config)
        .bind(&row.status)
        .bind(row.total_items)
        .bind(row.completed_items)
        .bind(row.failed_items)
        .bind(&row.started_at)
        .bind(&row.completed_at)
        .bind(&row.id)
        .bind(self.owner())
        .bind(self.owner())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("BatchJob", &batch.id));
        }
        Ok(())
    }

    async fn delete_batch(&self, id: &str) -> Result<()> {
        // Items are removed via ON DELETE CASCADE.
        let result =
            sqlx::query("DELETE FROM batch_jobs WHERE id = ? AND (? IS NULL OR owner_id = ?)")
                .bind(id)
                .bind(self.owner())
                .bind(self.owner())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("BatchJob", id));
        }
        Ok(())
    }

    async fn list_batches(&self) -> Result<Vec<BatchJob>> {
        let rows = sqlx::query_as::<_, BatchJobRow>(
            r#"
            SELECT * FROM batch_jobs
            WHERE (? IS NULL OR owner_id = ?)
            ORDER BY created_at DESC, id ASC
            "#,
        )
        .bind(self.owner())
        .bind(self.owner())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.to_batch()).collect())
    }

    async fn get_item(&self, id: &str) -> Result<QueueItem> {
        sqlx::query_as::<_, QueueItemRow>(
            r#"
            SELECT qi.* FROM queue_items qi
            JOIN batch_jobs b ON b.id = qi.batch_id
            WHERE qi.id = ? AND (? IS NULL OR b.owner_id = ?)
            "#,
        )
        .bind(id)
        .bind(self.owner())
        .bind(self.owner())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.to_item())
        .ok_or_else(|| Error::not_found("QueueItem", id))
    }

    async fn list_items(&self, batch_id: &str) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query_as::<_, QueueItemRow>(
            r#"
            SELECT qi.* FROM queue_items qi
            JOIN batch_jobs b ON b.id = qi.batch_id
            WHERE qi.batch_id = ? AND (? IS NULL OR b.owner_id = ?)
            ORDER BY qi.created_at ASC, qi.id ASC
            "#,
        )
        .bind(batch_id)
        .bind(self.owner())
        .bind(self.owner())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.to_item()).collect())
    }

    async fn list_eligible_items(&self, batch_id: &str) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query_as::<_, QueueItemRow>(
            r#"
            SELECT qi.* FROM queue_items qi
            JOIN batch_jobs b ON b.id = qi.batch_id
            WHERE qi.batch_id = ?
              AND qi.status IN ('PENDING', 'RETRYING')
              AND (? IS NULL OR b.owner_id = ?)
            ORDER BY qi.priority DESC, qi.created_at ASC, qi.id ASC
            "#,
        )
        .bind(batch_id)
        .bind(self.owner())
        .bind(self.owner())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.to_item()).collect())
    }

    async fn claim_item(&self, id: &str) -> Result<Option<QueueItem>> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query_as::<_, QueueItemRow>(
            r#"
            UPDATE queue_items
            SET status = 'PROCESSING',
                started_at = COALESCE(started_at, ?)
            WHERE id = ?
              AND status IN ('PENDING', 'RETRYING')
              AND batch_id IN (SELECT id FROM batch_jobs WHERE ? IS NULL OR owner_id = ?)
            RETURNING *
            "#,
        )
        .bind(&now)
        .bind(id)
        .bind(self.owner())
        .bind(self.owner())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.to_item()))
    }

    async fn update_item(&self, item: &QueueItem) -> Result<()> {
        let row = QueueItemRow::from_item(item);
        let result = sqlx::query(
            r#"
            UPDATE queue_items SET
                source_id = ?,
                priority = ?,
                status = ?,
                retry_count = ?,
                max_retries = ?,
                error = ?,
                progress = ?,
                stage = ?,
                metadata = ?,
                started_at = ?,
                completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&row.source_id)
        .bind(row.priority)
        .bind(&row.status)
        .bind(row.retry_count)
        .bind(row.max_retries)
        .bind(&row.error)
        .bind(row.progress)
        .bind(&row.stage)
        .bind(&row.metadata)
        .bind(&row.started_at)
        .bind(&row.completed_at)
        .bind(&row.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("QueueItem", &item.id));
        }
        Ok(())
    }

    async fn update_item_progress(
        &self,
        id: &str,
        progress: f32,
        stage: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE queue_items SET progress = ?, stage = COALESCE(?, stage) WHERE id = ?",
        )
        .bind(progress.clamp(0.0, 100.0) as f64)
        .bind(stage)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("QueueItem", id));
        }
        Ok(())
    }

    async fn bulk_update_status(
        &self,
        batch_id: &str,
        from: &[ItemStatus],
        to: ItemStatus,
    ) -> Result<u64> {
        if from.is_empty() {
            return Ok(0);
        }

        let sql = if to.is_terminal() {
            format!(
                r#"
                UPDATE queue_items
                SET status = ?, completed_at = COALESCE(completed_at, ?)
                WHERE batch_id = ? AND status IN ({})
                "#,
                status_placeholders(from)
            )
        } else {
            format!(
                "UPDATE queue_items SET status = ? WHERE batch_id = ? AND status IN ({})",
                status_placeholders(from)
            )
        };

        let mut query = sqlx::query(&sql).bind(to.as_str());
        if to.is_terminal() {
            query = query.bind(Utc::now().to_rfc3339());
        }
        query = query.bind(batch_id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn reset_failed_items(&self, batch_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'PENDING',
                retry_count = 0,
                error = NULL,
                progress = 0,
                stage = NULL,
                started_at = NULL,
                completed_at = NULL
            WHERE batch_id = ? AND status = 'FAILED'
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_items(&self, batch_id: &str) -> Result<ItemStatusCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS cnt FROM queue_items WHERE batch_id = ? GROUP BY status",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = ItemStatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let cnt: i64 = row.get("cnt");
            let cnt = cnt.max(0) as u64;
            counts.total += cnt;
            match ItemStatus::parse(&status) {
                Some(ItemStatus::Pending) => counts.pending += cnt,
                Some(ItemStatus::Processing) => counts.processing += cnt,
                Some(ItemStatus::Retrying) => counts.retrying += cnt,
                Some(ItemStatus::Completed) => counts.completed += cnt,
                Some(ItemStatus::Failed) => counts.failed += cnt,
                Some(ItemStatus::Cancelled) => counts.cancelled += cnt,
                None => {
                    tracing::warn!("Unknown item status '{}' in batch {}", status, batch_id);
                }
            }
        }
        Ok(counts)
    }

    async fn reset_orphaned_items(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'PENDING'
            WHERE status = 'PROCESSING'
              AND batch_id IN (SELECT id FROM batch_jobs WHERE ? IS NULL OR owner_id = ?)
            "#,
        )
        .bind(self.owner())
        .bind(self.owner())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_finished_batches(&self, retention_days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();
        let terminal = [
            BatchStatus::Completed.as_str(),
            BatchStatus::Failed.as_str(),
            BatchStatus::Cancelled.as_str(),
        ];

        let result = sqlx::query(
            r#"
            DELETE FROM batch_jobs
            WHERE status IN (?, ?, ?)
              AND completed_at IS NOT NULL
              AND completed_at < ?
              AND (? IS NULL OR owner_id = ?)
            "#,
        )
        .bind(terminal[0])
        .bind(terminal[1])
        .bind(terminal[2])
        .bind(&cutoff)
        .bind(self.owner())
        .bind(self.owner())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
