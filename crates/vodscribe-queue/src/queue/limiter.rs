//! Concurrency limiter for item processing.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{Error, Result};

/// Bounds how many queue items occupy the processing state at once.
///
/// Waiters are served in FIFO order. Permits are RAII guards, so a
/// processing attempt that errors or panics still releases its slot.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyLimiter {
    /// Create a limiter with the given number of processing slots.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Acquire a processing slot, suspending until one is available.
    pub async fn acquire(&self) -> Result<ProcessingPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Other(format!("Concurrency limiter closed: {}", e)))?;
        Ok(ProcessingPermit { _permit: permit })
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured slot count.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// A held processing slot. Dropping it releases the slot.
pub struct ProcessingPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release_on_drop() {
        let limiter = ConcurrencyLimiter::new(2);
        assert_eq!(limiter.available(), 2);

        let first = limiter.acquire().await.unwrap();
        let second = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 0);

        drop(first);
        assert_eq!(limiter.available(), 1);
        drop(second);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_zero_limit_clamped_to_one() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.limit(), 1);
        let _permit = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test]
    async fn test_waiter_resumes_when_slot_frees() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.map(|_| ()) })
        };

        // Waiter cannot finish while the slot is held.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }
}
