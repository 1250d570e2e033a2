//! Global token-bucket rate limiter.
//!
//! `refill_rate = target_rps` tokens per second, bucket size
//! `clamp(target_rps, 1, 10 000)`. The bucket starts empty so a freshly
//! started stage ramps at the target rate instead of bursting a full bucket.
//! A non-positive target disables the limiter entirely. Retargeting
//! re-clamps the bucket and wakes every waiter so they re-evaluate
//! (including discovering the limiter was disabled).

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use drill_domain::error::{Error, Result};

const MAX_BUCKET: f64 = 10_000.0;

struct BucketState {
    target_rps: f64,
    max_tokens: f64,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        if self.target_rps <= 0.0 {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.target_rps).min(self.max_tokens);
        self.last_refill = now;
    }
}

pub struct RateLimiter {
    state: Mutex<BucketState>,
    notify: Notify,
}

impl RateLimiter {
    pub fn new(target_rps: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                target_rps,
                max_tokens: bucket_size(target_rps),
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn target_rps(&self) -> f64 {
        self.state.lock().target_rps
    }

    /// Take one token, waiting for a refill if the bucket is dry. Returns
    /// immediately when the limiter is disabled. Honors cancellation.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let wait = {
                let mut state = self.state.lock();
                if state.target_rps <= 0.0 {
                    return Ok(());
                }
                state.refill(Instant::now());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / state.target_rps)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return Err(Error::EngineClosed),
            }
        }
    }

    /// Live retarget. Safe to call concurrently with waiters.
    pub fn update_target_rps(&self, target_rps: f64) {
        {
            let mut state = self.state.lock();
            // Settle the bucket at the old rate before switching.
            state.refill(Instant::now());
            state.target_rps = target_rps;
            state.max_tokens = bucket_size(target_rps);
            state.tokens = state.tokens.min(state.max_tokens);
        }
        self.notify.notify_waiters();
    }
}

fn bucket_size(target_rps: f64) -> f64 {
    target_rps.clamp(1.0, MAX_BUCKET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn disabled_limiter_never_waits() {
        let limiter = RateLimiter::new(0.0);
        let cancel = CancellationToken::new();
        for _ in 0..10_000 {
            limiter.acquire(&cancel).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn issues_close_to_rate_times_window() {
        // 50 rps over one second of virtual time.
        let limiter = Arc::new(RateLimiter::new(50.0));
        let cancel = CancellationToken::new();

        let mut issued = 0u32;
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            tokio::select! {
                result = limiter.acquire(&cancel) => {
                    result.unwrap();
                    issued += 1;
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        assert!((40..=60).contains(&issued), "issued {issued}, wanted ~50");
    }

    #[tokio::test(start_paused = true)]
    async fn token_issue_bounded_by_rate_plus_bucket() {
        // After a long idle gap the bucket is full (= clamp(rps, 1, 10k)),
        // so a burst of at most max_tokens + r*T can go through.
        let limiter = Arc::new(RateLimiter::new(20.0));
        let cancel = CancellationToken::new();
        tokio::time::advance(Duration::from_secs(60)).await;

        let mut burst = 0u32;
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            tokio::select! {
                result = limiter.acquire(&cancel) => {
                    result.unwrap();
                    burst += 1;
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        // r*T + max_tokens = 20 + 20.
        assert!(burst <= 40, "burst {burst} exceeded r*T + max_tokens");
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_wakes_on_refill() {
        let limiter = RateLimiter::new(10.0);
        let cancel = CancellationToken::new();
        // Empty bucket: one token at 10 rps is ~100ms away.
        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(90), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn retarget_to_disabled_releases_waiters() {
        let limiter = Arc::new(RateLimiter::new(0.001));
        let cancel = CancellationToken::new();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        tokio::task::yield_now().await;
        limiter.update_target_rps(0.0);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retarget_speeds_up_waiters() {
        let limiter = Arc::new(RateLimiter::new(0.5));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        tokio::task::yield_now().await;
        limiter.update_target_rps(1000.0);
        waiter.await.unwrap().unwrap();
        // At 0.5 rps the first token is 2s out; the retarget delivers it
        // almost immediately.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiters() {
        let limiter = Arc::new(RateLimiter::new(0.001));
        let cancel = CancellationToken::new();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(Error::EngineClosed)));
    }
}
