//! Sliding-window request limiters.
//!
//! # Design
//! - One limiter per (provider, tier), built once at startup and shared.
//! - State sits behind a short synchronous mutex that is never held across an
//!   await; the waiter count is a plain atomic.
//! - Callers beyond the waiter bound are rejected at once with the wait they
//!   would have needed, so a saturated provider degrades into deferrals.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ResilienceError, ResilienceResult};

/// At most `max_requests` admissions in any trailing `window`.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    name: String,
    max_requests: usize,
    window: Duration,
    queue_limit: usize,
    admitted: Mutex<VecDeque<Instant>>,
    waiters: AtomicUsize,
}

struct WaiterSlot<'a>(&'a AtomicUsize);

impl Drop for WaiterSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SlidingWindowLimiter {
    /// Build a limiter. A zero `max_requests` is treated as one.
    #[must_use]
    pub fn new(name: impl Into<String>, max_requests: usize, window: Duration, queue_limit: usize) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            name: name.into(),
            max_requests,
            window,
            queue_limit,
            admitted: Mutex::new(VecDeque::with_capacity(max_requests)),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Tier name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Callers currently waiting for a slot.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    fn admitted(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.admitted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit now if a slot is free, otherwise return the wait until one frees.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.try_admit().map(|_| ())
    }

    fn try_admit(&self) -> Result<Instant, Duration> {
        let now = Instant::now();
        let mut admitted = self.admitted();
        while let Some(oldest) = admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }
        if admitted.len() < self.max_requests {
            admitted.push_back(now);
            return Ok(now);
        }
        let oldest = admitted.front().copied().unwrap_or(now);
        Err((oldest + self.window).saturating_duration_since(now))
    }

    /// Give back a slot taken at `admitted_at` for a call that was never made.
    pub fn release(&self, admitted_at: Instant) {
        let mut admitted = self.admitted();
        if let Some(index) = admitted.iter().rposition(|at| *at == admitted_at) {
            admitted.remove(index);
        }
    }

    /// Wait for a slot.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::QueueFull`] when the waiter bound is reached
    /// and [`ResilienceError::Cancelled`] when `cancel` fires while waiting.
    pub async fn acquire(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
    ) -> ResilienceResult<()> {
        self.admit(operation, cancel).await.map(|_| ())
    }

    async fn admit(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
    ) -> ResilienceResult<Instant> {
        let mut wait = match self.try_admit() {
            Ok(at) => return Ok(at),
            Err(wait) => wait,
        };

        if self.waiters.fetch_add(1, Ordering::AcqRel) >= self.queue_limit {
            self.waiters.fetch_sub(1, Ordering::AcqRel);
            return Err(ResilienceError::QueueFull {
                limiter: self.name.clone(),
                retry_after: wait,
            });
        }
        let _slot = WaiterSlot(&self.waiters);

        loop {
            debug!(limiter = %self.name, operation, wait_ms = wait.as_millis(), "waiting for rate limit slot");
            tokio::select! {
                () = cancel.cancelled() => return Err(ResilienceError::Cancelled { operation }),
                () = sleep(wait) => {}
            }
            match self.try_admit() {
                Ok(at) => return Ok(at),
                Err(next) => wait = next.max(Duration::from_millis(1)),
            }
        }
    }
}

/// Every tier of one provider; a call needs a slot from each.
#[derive(Debug, Clone, Default)]
pub struct LimiterSet {
    tiers: Vec<Arc<SlidingWindowLimiter>>,
}

impl LimiterSet {
    /// Wrap the provider's tiers.
    #[must_use]
    pub const fn new(tiers: Vec<Arc<SlidingWindowLimiter>>) -> Self {
        Self { tiers }
    }

    /// Set without any limits.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self { tiers: Vec::new() }
    }

    /// Configured tiers.
    #[must_use]
    pub fn tiers(&self) -> &[Arc<SlidingWindowLimiter>] {
        &self.tiers
    }

    /// Acquire one slot from every tier, in order.
    ///
    /// Slots already taken are released when a later tier fails, so a
    /// rejected call costs no tier any budget.
    ///
    /// # Errors
    ///
    /// Propagates the first tier failure.
    pub async fn acquire(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
    ) -> ResilienceResult<()> {
        let mut taken = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            match tier.admit(operation, cancel).await {
                Ok(at) => taken.push((tier, at)),
                Err(err) => {
                    for (tier, at) in taken {
                        tier.release(at);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn window_admits_max_requests_then_waits() -> anyhow::Result<()> {
        let limiter = SlidingWindowLimiter::new("per_second", 2, Duration::from_secs(1), 8);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        limiter.acquire("op", &cancel).await?;
        limiter.acquire("op", &cancel).await?;
        assert!(limiter.try_acquire().is_err());

        limiter.acquire("op", &cancel).await?;
        assert!(start.elapsed() >= Duration::from_secs(1));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_with_needed_wait() {
        let limiter = Arc::new(SlidingWindowLimiter::new("per_minute", 1, Duration::from_secs(60), 1));
        let cancel = CancellationToken::new();
        assert!(limiter.try_acquire().is_ok());

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire("op", &cancel).await })
        };
        while limiter.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        let err = limiter.acquire("op", &cancel).await.unwrap_err();
        match err {
            ResilienceError::QueueFull { retry_after, .. } => {
                assert!(retry_after > Duration::ZERO && retry_after <= Duration::from_secs(60));
            }
            other => panic!("unexpected error: {other}"),
        }

        cancel.cancel();
        let cancelled = waiter.await.expect("waiter panicked");
        assert!(matches!(cancelled, Err(ResilienceError::Cancelled { .. })));
        assert_eq!(limiter.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_requires_every_tier() -> anyhow::Result<()> {
        let fast = Arc::new(SlidingWindowLimiter::new("per_second", 10, Duration::from_secs(1), 8));
        let slow = Arc::new(SlidingWindowLimiter::new("per_minute", 1, Duration::from_secs(60), 8));
        let set = LimiterSet::new(vec![fast, Arc::clone(&slow)]);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        set.acquire("op", &cancel).await?;
        set.acquire("op", &cancel).await?;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(set.tiers().len(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_calls_give_back_earlier_tiers() -> anyhow::Result<()> {
        let fast = Arc::new(SlidingWindowLimiter::new("fast", 2, Duration::from_secs(60), 0));
        let slow = Arc::new(SlidingWindowLimiter::new("slow", 1, Duration::from_secs(60), 0));
        let set = LimiterSet::new(vec![Arc::clone(&fast), slow]);
        let cancel = CancellationToken::new();

        set.acquire("op", &cancel).await?;
        let err = set.acquire("op", &cancel).await.unwrap_err();
        assert!(matches!(err, ResilienceError::QueueFull { ref limiter, .. } if limiter == "slow"));

        assert!(fast.try_acquire().is_ok());
        assert!(fast.try_acquire().is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waits_release_held_slots() -> anyhow::Result<()> {
        let fast = Arc::new(SlidingWindowLimiter::new("fast", 1, Duration::from_secs(60), 4));
        let slow = Arc::new(SlidingWindowLimiter::new("slow", 1, Duration::from_secs(60), 4));
        let set = LimiterSet::new(vec![Arc::clone(&fast), Arc::clone(&slow)]);
        assert!(slow.try_acquire().is_ok());

        let cancel = CancellationToken::new();
        let pending = {
            let set = set.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { set.acquire("op", &cancel).await })
        };
        while slow.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        assert!(matches!(pending.await?, Err(ResilienceError::Cancelled { .. })));
        assert!(fast.try_acquire().is_ok());
        Ok(())
    }
}
