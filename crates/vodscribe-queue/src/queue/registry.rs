//! Item processor trait and registry.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use std::sync::Arc;

use super::job::QueueItem;
use super::progress::ProgressHandle;
use crate::{Error, Result};

/// A caller-supplied processor performing the work for one queue item of a
/// given job type.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// The job type this processor handles.
    fn job_type(&self) -> &str;

    /// Validate the batch-level configuration before any item is dispatched.
    ///
    /// Invoked once per dispatch pass; a rejected config fails the batch
    /// without claiming any item.
    fn validate_config(&self, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Process one queue item, reporting progress through `progress`.
    ///
    /// Errors drive the retry state machine; they never abort the batch.
    /// Cancellation is cooperative: long-running implementations should
    /// check item state if they want to observe a batch cancellation.
    async fn process(&self, item: &QueueItem, progress: ProgressHandle) -> Result<()>;
}

type ProcessFn =
    dyn Fn(QueueItem, ProgressHandle) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Adapter wrapping an async closure as an [`ItemProcessor`].
struct FnProcessor {
    job_type: String,
    process: Box<ProcessFn>,
}

#[async_trait]
impl ItemProcessor for FnProcessor {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn process(&self, item: &QueueItem, progress: ProgressHandle) -> Result<()> {
        (self.process)(item.clone(), progress).await
    }
}

/// Concurrent mapping of job type to processor.
///
/// Injected into the queue manager rather than held as a process-wide
/// global, so tests can use isolated registries.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: DashMap<String, Arc<dyn ItemProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor under its job type.
    ///
    /// Exactly one processor is allowed per job type; registering a second
    /// one is a validation error.
    pub fn register(&self, processor: Arc<dyn ItemProcessor>) -> Result<()> {
        let job_type = processor.job_type().to_string();
        match self.processors.entry(job_type) {
            Entry::Occupied(entry) => Err(Error::validation(format!(
                "Processor already registered for job type '{}'",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(processor);
                Ok(())
            }
        }
    }

    /// Register an async closure as the processor for `job_type`.
    pub fn register_fn<F>(&self, job_type: impl Into<String>, process: F) -> Result<()>
    where
        F: Fn(QueueItem, ProgressHandle) -> BoxFuture<'static, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.register(Arc::new(FnProcessor {
            job_type: job_type.into(),
            process: Box::new(process),
        }))
    }

    /// Look up the processor for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn ItemProcessor>> {
        self.processors.get(job_type).map(|entry| entry.value().clone())
    }

    /// Registered job types.
    pub fn job_types(&self) -> Vec<String> {
        self.processors
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}
