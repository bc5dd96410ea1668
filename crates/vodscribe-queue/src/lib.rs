//! Batch job queue and retry scheduling for the vodscribe processing
//! pipeline.
//!
//! Callers create a batch of queue items, register a processor per job
//! type and hand both to the [`queue::QueueManager`]. The manager
//! dispatches eligible items under a concurrency limit, retries failures
//! with exponential backoff and keeps the batch aggregate status current
//! in the backing [`store::BatchStore`].

pub mod error;
pub mod queue;
pub mod store;

pub use error::{Error, Result};
pub use queue::{
    BatchJob, BatchStatus, BatchSummary, ItemProcessor, ItemStatus, ProcessorRegistry,
    ProgressHandle, QueueItem, QueueManager, QueueManagerConfig, RetryPolicy,
};
pub use store::{BatchStore, ItemStatusCounts, MemoryBatchStore, SqlxBatchStore};
