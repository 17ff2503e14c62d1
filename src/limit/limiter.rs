//! Bandwidth limiter module
//!
//! One shared signed byte-credit counter per traffic class. Transfers
//! acquire credit before moving bytes and park while the pool is empty;
//! the provider refills the pool once per tick and wakes all waiters.

use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::trace;

/// Credit value denoting an unlimited pool
const UNLIMITED: i64 = -1;

/// A shared, periodically-refilled byte-credit pool.
///
/// The internal lock is independent of any swarm lock; many transfer
/// tasks may acquire from the same limiter concurrently.
#[derive(Debug)]
pub struct BandwidthLimiter {
    available: Mutex<i64>,
    refilled: Notify,
}

impl BandwidthLimiter {
    /// Create a limiter with an initial credit of `credit` bytes
    pub fn limited(credit: u64) -> Self {
        Self {
            available: Mutex::new(credit as i64),
            refilled: Notify::new(),
        }
    }

    /// Create an unlimited limiter
    pub fn unlimited() -> Self {
        Self {
            available: Mutex::new(UNLIMITED),
            refilled: Notify::new(),
        }
    }

    /// True if the limiter currently imposes no limit
    pub fn is_unlimited(&self) -> bool {
        *self.available.lock().unwrap() == UNLIMITED
    }

    /// Currently available credit; `-1` denotes unlimited
    pub fn available(&self) -> i64 {
        *self.available.lock().unwrap()
    }

    /// Acquire up to `requested` bytes of credit.
    ///
    /// Suspends the caller while no credit is available and returns
    /// `min(available, requested)` once there is; an unlimited limiter
    /// always grants the full amount immediately. The returned future is
    /// cancel-safe: aborting the owning task while parked here leaves the
    /// pool untouched.
    pub async fn request_bandwidth(&self, requested: u64) -> u64 {
        if requested == 0 {
            return 0;
        }
        loop {
            // Register for the wakeup before checking, so a refill between
            // the check and the await is not lost.
            let refilled = self.refilled.notified();
            {
                let mut available = self.available.lock().unwrap();
                if *available == UNLIMITED {
                    return requested;
                }
                if *available > 0 {
                    let granted = (*available as u64).min(requested);
                    *available -= granted as i64;
                    trace!("Granted {} of {} requested bytes", granted, requested);
                    return granted;
                }
            }
            refilled.await;
        }
    }

    /// Credit back unused bytes, e.g. after a short read at end of
    /// stream. No-op on unlimited limiters.
    pub fn return_available(&self, unused: u64) {
        if unused == 0 {
            return;
        }
        let mut available = self.available.lock().unwrap();
        if *available == UNLIMITED {
            return;
        }
        *available += unused as i64;
        drop(available);
        self.refilled.notify_waiters();
    }

    /// Reset the pool to `credit` bytes (`-1` = unlimited) and wake all
    /// suspended acquirers. Called by the provider once per tick.
    pub(crate) fn refill(&self, credit: i64) {
        {
            let mut available = self.available.lock().unwrap();
            *available = credit;
        }
        self.refilled.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_grants_min_of_available_and_requested() {
        let limiter = BandwidthLimiter::limited(100);
        assert_eq!(limiter.request_bandwidth(40).await, 40);
        assert_eq!(limiter.request_bandwidth(100).await, 60);
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test]
    async fn test_unlimited_never_suspends() {
        let limiter = BandwidthLimiter::unlimited();
        for _ in 0..100 {
            assert_eq!(limiter.request_bandwidth(1_000_000).await, 1_000_000);
        }
        assert!(limiter.is_unlimited());
    }

    #[tokio::test]
    async fn test_zero_request_is_immediate() {
        let limiter = BandwidthLimiter::limited(0);
        assert_eq!(limiter.request_bandwidth(0).await, 0);
    }

    #[tokio::test]
    async fn test_suspends_until_refill() {
        let limiter = Arc::new(BandwidthLimiter::limited(0));
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.request_bandwidth(50).await })
        };

        // Give the waiter time to park
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        limiter.refill(200);
        let granted = waiter.await.unwrap();
        assert_eq!(granted, 50);
        assert_eq!(limiter.available(), 150);
    }

    #[tokio::test]
    async fn test_return_available_wakes_waiter() {
        let limiter = Arc::new(BandwidthLimiter::limited(0));
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.request_bandwidth(10).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.return_available(10);
        assert_eq!(waiter.await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_return_available_noop_on_unlimited() {
        let limiter = BandwidthLimiter::unlimited();
        limiter.return_available(500);
        assert!(limiter.is_unlimited());
    }

    #[tokio::test]
    async fn test_rate_bound_over_refills() {
        // Cumulative grants never exceed R * periods + one bucket
        let limiter = Arc::new(BandwidthLimiter::limited(100));
        let mut granted = 0u64;
        for _ in 0..3 {
            loop {
                let g = limiter.request_bandwidth(64).await;
                granted += g;
                if limiter.available() == 0 {
                    break;
                }
            }
            limiter.refill(100);
        }
        assert!(granted <= 100 * 3 + 100);
    }

    #[tokio::test]
    async fn test_refill_to_unlimited() {
        let limiter = BandwidthLimiter::limited(10);
        limiter.refill(-1);
        assert!(limiter.is_unlimited());
        assert_eq!(limiter.request_bandwidth(12345).await, 12345);
    }
}
