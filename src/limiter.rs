//! Bounds the number of simultaneously in-flight capability calls.

use crate::error::EngineError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Semaphore-backed concurrency bound for chunk processing.
///
/// At most `max_concurrent` permits are out at any instant; callers
/// awaiting [`ConcurrencyLimiter::acquire`] are admitted in submission
/// order as slots free up. Permits are released on drop.
///
/// Cloning is cheap and shares the underlying permit pool.
///
/// # Examples
///
/// ```
/// use kizami::ConcurrencyLimiter;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let limiter = ConcurrencyLimiter::new(2);
/// let first = limiter.acquire().await.expect("permit");
/// let second = limiter.acquire().await.expect("permit");
/// assert_eq!(limiter.available(), 0);
/// drop(first);
/// assert_eq!(limiter.available(), 1);
/// # drop(second);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ConcurrencyLimiter {
    /// Creates a limiter admitting at most `max_concurrent` tasks.
    ///
    /// A bound of 0 is treated as 1: a limiter that admits nothing would
    /// deadlock every run.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Waits for a free slot and returns its permit.
    ///
    /// The slot is held until the permit is dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, EngineError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Cancelled)
    }

    /// The configured concurrency bound.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Currently free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::task::JoinSet;

    #[test]
    fn test_zero_bound_is_clamped_to_one() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.max_concurrent(), 1);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let limiter = ConcurrencyLimiter::new(1);
        let permit = limiter.acquire().await.expect("permit");
        assert_eq!(limiter.available(), 0);
        drop(permit);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_bound() {
        let limiter = ConcurrencyLimiter::new(3);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut set = JoinSet::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            set.spawn(async move {
                let _permit = limiter.acquire().await.expect("permit");
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while set.join_next().await.is_some() {}

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
