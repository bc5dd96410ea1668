//! Batch queue orchestration.
//!
//! The queue manager is responsible for:
//! - Selecting runnable items in priority order
//! - Dispatching them to registered processors under a concurrency limit
//! - Driving the per-item retry state machine with exponential backoff
//! - Aggregating batch-level status and progress

mod job;
mod limiter;
mod manager;
mod progress;
mod registry;
mod retry;

pub use job::{BatchJob, BatchStatus, BatchSummary, ItemStatus, QueueItem};
pub use limiter::{ConcurrencyLimiter, ProcessingPermit};
pub use manager::{QueueManager, QueueManagerConfig};
pub use progress::ProgressHandle;
pub use registry::{ItemProcessor, ProcessorRegistry};
pub use retry::RetryPolicy;
