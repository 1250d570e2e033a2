//! Per-VU in-flight cap: a counted semaphore whose waiters honor
//! cancellation.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use drill_domain::error::{Error, Result};

#[derive(Clone)]
pub struct InFlightLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Held while one operation is in flight; dropping releases the slot.
pub struct InFlightSlot {
    _permit: OwnedSemaphorePermit,
}

impl InFlightLimiter {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1) as usize;
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<InFlightSlot> {
        tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                let permit = permit.map_err(|_| Error::EngineClosed)?;
                Ok(InFlightSlot { _permit: permit })
            }
            _ = cancel.cancelled() => Err(Error::EngineClosed),
        }
    }

    /// Currently held slots.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capacity_bounds_concurrency() {
        let limiter = InFlightLimiter::new(2);
        let cancel = CancellationToken::new();

        let a = limiter.acquire(&cancel).await.unwrap();
        let _b = limiter.acquire(&cancel).await.unwrap();
        assert_eq!(limiter.in_flight(), 2);

        // Third waits until a slot frees.
        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(a);
        let slot = waiter.await.unwrap();
        assert!(slot.is_ok());
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped_to_one() {
        let limiter = InFlightLimiter::new(0);
        assert_eq!(limiter.capacity(), 1);
        let cancel = CancellationToken::new();
        let _slot = limiter.acquire(&cancel).await.unwrap();
        assert_eq!(limiter.in_flight(), 1);
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiters() {
        let limiter = InFlightLimiter::new(1);
        let cancel = CancellationToken::new();
        let _held = limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(Error::EngineClosed)));
    }

    #[tokio::test]
    async fn slot_release_restores_capacity() {
        let limiter = InFlightLimiter::new(3);
        let cancel = CancellationToken::new();
        {
            let _a = limiter.acquire(&cancel).await.unwrap();
            let _b = limiter.acquire(&cancel).await.unwrap();
            assert_eq!(limiter.in_flight(), 2);
        }
        assert_eq!(limiter.in_flight(), 0);
    }
}
