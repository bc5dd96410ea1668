//! Batch job and queue item domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Batch job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Batch has been created and no item has settled yet.
    Pending,
    /// Dispatch has started, or at least one item has settled.
    Processing,
    /// Future dispatch is halted; in-flight items finish naturally.
    Paused,
    /// Every item completed successfully.
    Completed,
    /// All items settled and at least one failed.
    Failed,
    /// Cancelled by explicit user action.
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "PAUSED" => Some(Self::Paused),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Queue item status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    /// Eligible for dispatch. Initial state.
    Pending,
    /// Actively running under a concurrency permit.
    Processing,
    /// Failed with retries remaining; re-enters processing after a delay.
    Retrying,
    /// Finished successfully.
    Completed,
    /// Failed with retries exhausted.
    Failed,
    /// Cancelled before it could run.
    Cancelled,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Retrying => "RETRYING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "RETRYING" => Some(Self::Retrying),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the item can still be picked up by a dispatch pass.
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }
}

/// A batch job: a named collection of queue items tracked as one unit.
#[derive(Debug, Clone)]
pub struct BatchJob {
    /// Unique batch job ID.
    pub id: String,
    /// Owning user. Authorization boundary, enforced at the store.
    pub owner_id: String,
    /// Display name.
    pub name: String,
    /// Job type tag; selects the registered processor.
    pub job_type: String,
    /// Opaque job configuration, validated by the processor at dispatch.
    pub config: serde_json::Value,
    /// Current aggregate status.
    pub status: BatchStatus,
    /// Number of items, fixed at creation.
    pub total_items: u32,
    /// Number of items that completed successfully.
    pub completed_items: u32,
    /// Number of items that failed after exhausting retries.
    pub failed_items: u32,
    /// When the batch was created.
    pub created_at: DateTime<Utc>,
    /// When the batch first entered processing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the batch first reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    /// Create a new batch job.
    pub fn new(
        owner_id: impl Into<String>,
        name: impl Into<String>,
        job_type: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            name: name.into(),
            job_type: job_type.into(),
            config: serde_json::Value::Null,
            status: BatchStatus::Pending,
            total_items: 0,
            completed_items: 0,
            failed_items: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the job configuration.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Fraction of items completed, as a percentage. 0 when the batch is empty.
    pub fn progress_percent(&self) -> f32 {
        if self.total_items == 0 {
            return 0.0;
        }
        self.completed_items as f32 / self.total_items as f32 * 100.0
    }
}

/// One unit of work within a batch job.
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// Unique item ID.
    pub id: String,
    /// Owning batch job. Deleting the batch deletes its items.
    pub batch_id: String,
    /// Optional reference to the unit of work (e.g. an uploaded video).
    pub source_id: Option<String>,
    /// Scheduling priority; higher runs first.
    pub priority: i32,
    /// Current status.
    pub status: ItemStatus,
    /// Number of retry attempts so far.
    pub retry_count: u32,
    /// Maximum retry attempts before the item fails permanently.
    pub max_retries: u32,
    /// Last error message, if any attempt failed.
    pub error: Option<String>,
    /// Progress in percent, clamped to [0, 100].
    pub progress: f32,
    /// Current processing-stage label.
    pub stage: Option<String>,
    /// Arbitrary metadata for the processor.
    pub metadata: serde_json::Value,
    /// When the item was created.
    pub created_at: DateTime<Utc>,
    /// When the item first entered processing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the item reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Create a new item in the pending state.
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id: batch_id.into(),
            source_id: None,
            priority: 0,
            status: ItemStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            error: None,
            progress: 0.0,
            stage: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the reference to the unit of work.
    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    /// Set the maximum retry attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the item metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check whether another retry attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count + 1 <= self.max_retries
    }
}

/// Read-side aggregate view of a batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub id: String,
    pub name: String,
    pub job_type: String,
    pub status: BatchStatus,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
    pub progress_percent: f32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&BatchJob> for BatchSummary {
    fn from(batch: &BatchJob) -> Self {
        Self {
            id: batch.id.clone(),
            name: batch.name.clone(),
            job_type: batch.job_type.clone(),
            status: batch.status,
            total_items: batch.total_items,
            completed_items: batch.completed_items,
            failed_items: batch.failed_items,
            progress_percent: batch.progress_percent(),
            created_at: batch.created_at,
            started_at: batch.started_at,
            completed_at: batch.completed_at,
        }
    }
}
