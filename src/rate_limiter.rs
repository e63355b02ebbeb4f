//! Bounded-concurrency admission queue for extractors (spec.md 4.6).
//!
//! Grounded on `enterprise/ratelimit/algorithm.rs`'s token/semaphore
//! admission style, implemented with `tokio::sync::Semaphore` rather
//! than a hand-rolled queue, matching `database/connection_pool.rs`'s
//! own reach for `tokio::sync` primitives. `tokio::sync::Semaphore`
//! already serves waiters in FIFO order, which is what spec.md 4.6 requires.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default local parallelism: available CPU cores, clamped to `[1, 8]`.
pub fn default_local_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 8)
}

/// Default remote-download parallelism.
pub const DEFAULT_REMOTE_PARALLELISM: usize = 2;

/// Which admission pool a caller is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Local,
    Remote,
}

/// Holds the permit for the whole extract-plus-decode phase of one
/// request (spec.md 4.6: "the pipeline holds admission for the whole
/// extract-plus-decode phase for a single request").
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

/// Two independent admission pools, one per extractor family.
pub struct RateLimiter {
    local: Arc<Semaphore>,
    remote: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(local_parallelism: usize, remote_parallelism: usize) -> Self {
        Self {
            local: Arc::new(Semaphore::new(local_parallelism.max(1))),
            remote: Arc::new(Semaphore::new(remote_parallelism.max(1))),
        }
    }

    /// Wait for admission into `pool`. Waiters are served FIFO by the
    /// underlying semaphore.
    pub async fn acquire(&self, pool: Pool) -> Admission {
        let semaphore = match pool {
            Pool::Local => &self.local,
            Pool::Remote => &self.remote,
        };
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("rate limiter semaphore is never closed");
        Admission { _permit: permit }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(default_local_parallelism(), DEFAULT_REMOTE_PARALLELISM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn admits_up_to_the_configured_parallelism() {
        let limiter = Arc::new(RateLimiter::new(2, 1));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let max_observed = max_observed.clone();
            handles.push(tokio::spawn(async move {
                let _admission = limiter.acquire(Pool::Local).await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn default_local_parallelism_is_clamped() {
        let n = default_local_parallelism();
        assert!((1..=8).contains(&n));
    }
}
