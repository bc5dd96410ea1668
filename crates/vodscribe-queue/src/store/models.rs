//! Database row models and conversions to the domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::queue::{BatchJob, BatchStatus, ItemStatus, QueueItem};

/// Batch job row. Timestamps are RFC 3339 text, statuses their string form.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BatchJobRow {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub job_type: String,
    /// JSON blob for job-specific configuration.
    pub config: String,
    pub status: String,
    pub total_items: i64,
    pub completed_items: i64,
    pub failed_items: i64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Queue item row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueItemRow {
    pub id: String,
    pub batch_id: String,
    pub source_id: Option<String>,
    pub priority: i64,
    pub status: String,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error: Option<String>,
    pub progress: f64,
    pub stage: Option<String>,
    /// JSON blob for processor-specific metadata.
    pub metadata: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_optional_timestamp(s: Option<&String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

fn parse_json_or_null(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or(serde_json::Value::Null)
}

impl BatchJobRow {
    pub fn from_batch(batch: &BatchJob) -> Self {
        Self {
            id: batch.id.clone(),
            owner_id: batch.owner_id.clone(),
            name: batch.name.clone(),
            job_type: batch.job_type.clone(),
            config: batch.config.to_string(),
            status: batch.status.as_str().to_string(),
            total_items: batch.total_items as i64,
            completed_items: batch.completed_items as i64,
            failed_items: batch.failed_items as i64,
            created_at: batch.created_at.to_rfc3339(),
            started_at: batch.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: batch.completed_at.map(|dt| dt.to_rfc3339()),
        }
    }

    pub fn to_batch(&self) -> BatchJob {
        BatchJob {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            name: self.name.clone(),
            job_type: self.job_type.clone(),
            config: parse_json_or_null(&self.config),
            status: BatchStatus::parse(&self.status).unwrap_or(BatchStatus::Pending),
            total_items: self.total_items.max(0) as u32,
            completed_items: self.completed_items.max(0) as u32,
            failed_items: self.failed_items.max(0) as u32,
            created_at: parse_timestamp(&self.created_at),
            started_at: parse_optional_timestamp(self.started_at.as_ref()),
            completed_at: parse_optional_timestamp(self.completed_at.as_ref()),
        }
    }
}

impl QueueItemRow {
    pub fn from_item(item: &QueueItem) -> Self {
        Self {
            id: item.id.clone(),
            batch_id: item.batch_id.clone(),
            source_id: item.source_id.clone(),
            priority: item.priority as i64,
            status: item.status.as_str().to_string(),
            retry_count: item.retry_count as i64,
            max_retries: item.max_retries as i64,
            error: item.error.clone(),
            progress: item.progress as f64,
            stage: item.stage.clone(),
            metadata: item.metadata.to_string(),
            created_at: item.created_at.to_rfc3339(),
            started_at: item.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: item.completed_at.map(|dt| dt.to_rfc3339()),
        }
    }

    pub fn to_item(&self) -> QueueItem {
        QueueItem {
            id: self.id.clone(),
            batch_id: self.batch_id.clone(),
            source_id: self.source_id.clone(),
            priority: self.priority as i32,
            status: ItemStatus::parse(&self.status).unwrap_or(ItemStatus::Pending),
            retry_count: self.retry_count.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            error: self.error.clone(),
            progress: (self.progress as f32).clamp(0.0, 100.0),
            stage: self.stage.clone(),
            metadata: parse_json_or_null(&self.metadata),
            created_at: parse_timestamp(&self.created_at),
            started_at: parse_optional_timestamp(self.started_at.as_ref()),
            completed_at: parse_optional_timestamp(self.completed_at.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_row_round_trip() {
        let batch = BatchJob::new("user-1", "uploads", "transcribe")
            .with_config(serde_json::json!({"language": "en"}));
        let row = BatchJobRow::from_batch(&batch);
        let back = row.to_batch();

        assert_eq!(back.id, batch.id);
        assert_eq!(back.owner_id, "user-1");
        assert_eq!(back.status, BatchStatus::Pending);
        assert_eq!(back.config["language"], "en");
        assert_eq!(back.created_at, batch.created_at);
    }

    #[test]
    fn test_item_row_round_trip() {
        let item = QueueItem::new("batch-1")
            .with_priority(5)
            .with_source("video-9")
            .with_max_retries(2);
        let row = QueueItemRow::from_item(&item);
        let back = row.to_item();

        assert_eq!(back.id, item.id);
        assert_eq!(back.batch_id, "batch-1");
        assert_eq!(back.priority, 5);
        assert_eq!(back.max_retries, 2);
        assert_eq!(back.status, ItemStatus::Pending);
    }

    #[test]
    fn test_unknown_status_falls_back_to_pending() {
        let item = QueueItem::new("batch-1");
        let mut row = QueueItemRow::from_item(&item);
        row.status = "BOGUS".to_string();
        assert_eq!(row.to_item().status, ItemStatus::Pending);
    }
}
