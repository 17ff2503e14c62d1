//! Bandwidth provider module
//!
//! Owns the refill timer for all registered limiters. Registration is
//! explicit: a limiter that is deregistered stops receiving refills, so
//! collaborators own the lifetime of their registrations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::limit::limiter::BandwidthLimiter;

/// Handle for one limiter registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LimiterId(u64);

#[derive(Debug)]
struct Registration {
    limiter: Arc<BandwidthLimiter>,
    bytes_per_second: u64,
}

/// Periodically refills every registered limiter to one tick's worth of
/// credit: a token bucket with bucket size = `bytes_per_second x tick`.
/// A rate of 0 means unlimited.
#[derive(Debug)]
pub struct BandwidthProvider {
    registrations: Arc<Mutex<HashMap<LimiterId, Registration>>>,
    next_id: AtomicU64,
    period: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl BandwidthProvider {
    /// Create a provider with the standard one-second refill tick
    pub fn new() -> Self {
        Self::with_period(Duration::from_secs(1))
    }

    /// Create a provider with a custom refill tick
    pub fn with_period(period: Duration) -> Self {
        Self {
            registrations: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            period,
            timer: Mutex::new(None),
        }
    }

    /// Register a limiter to be refilled at `bytes_per_second`
    /// (0 = unlimited). The limiter is filled once immediately.
    pub fn register(&self, limiter: Arc<BandwidthLimiter>, bytes_per_second: u64) -> LimiterId {
        let id = LimiterId(self.next_id.fetch_add(1, Ordering::Relaxed));
        limiter.refill(Self::tick_credit(bytes_per_second, self.period));
        let mut registrations = self.registrations.lock().unwrap();
        registrations.insert(
            id,
            Registration {
                limiter,
                bytes_per_second,
            },
        );
        debug!("Registered limiter {:?} at {} B/s", id, bytes_per_second);
        id
    }

    /// Change the refill rate of a registered limiter. Takes effect
    /// immediately and on every following tick.
    pub fn set_limit_bps(&self, id: LimiterId, bytes_per_second: u64) {
        let mut registrations = self.registrations.lock().unwrap();
        if let Some(reg) = registrations.get_mut(&id) {
            reg.bytes_per_second = bytes_per_second;
            reg.limiter
                .refill(Self::tick_credit(bytes_per_second, self.period));
            debug!("Limiter {:?} now {} B/s", id, bytes_per_second);
        }
    }

    /// Remove a registration. The limiter keeps whatever credit it has
    /// but receives no further refills.
    pub fn deregister(&self, id: LimiterId) {
        let mut registrations = self.registrations.lock().unwrap();
        if registrations.remove(&id).is_some() {
            debug!("Deregistered limiter {:?}", id);
        }
    }

    /// Number of active registrations
    pub fn registered_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    /// Start the refill timer task
    pub fn start(&self) {
        let mut timer = self.timer.lock().unwrap();
        if timer.is_some() {
            return;
        }
        info!("Starting bandwidth provider (tick: {:?})", self.period);
        let registrations = self.registrations.clone();
        let period = self.period;
        *timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let registrations = registrations.lock().unwrap();
                for reg in registrations.values() {
                    reg.limiter
                        .refill(Self::tick_credit(reg.bytes_per_second, period));
                }
            }
        }));
    }

    /// Stop the refill timer. Registered limiters keep their last credit.
    pub fn shutdown(&self) {
        let mut timer = self.timer.lock().unwrap();
        if let Some(handle) = timer.take() {
            handle.abort();
            info!("Bandwidth provider stopped");
        }
    }

    fn tick_credit(bytes_per_second: u64, period: Duration) -> i64 {
        if bytes_per_second == 0 {
            -1
        } else {
            (bytes_per_second as f64 * period.as_secs_f64()).max(1.0) as i64
        }
    }
}

impl Default for BandwidthProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BandwidthProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_fills_immediately() {
        let provider = BandwidthProvider::new();
        let limiter = Arc::new(BandwidthLimiter::limited(0));
        provider.register(limiter.clone(), 4096);
        assert_eq!(limiter.available(), 4096);
    }

    #[tokio::test]
    async fn test_zero_rate_means_unlimited() {
        let provider = BandwidthProvider::new();
        let limiter = Arc::new(BandwidthLimiter::limited(0));
        provider.register(limiter.clone(), 0);
        assert!(limiter.is_unlimited());
    }

    #[tokio::test]
    async fn test_periodic_refill() {
        let provider = BandwidthProvider::with_period(Duration::from_millis(20));
        let limiter = Arc::new(BandwidthLimiter::limited(0));
        provider.register(limiter.clone(), 1000);
        provider.start();

        // Drain the bucket, then wait for the timer to restore it
        let drained = limiter.request_bandwidth(1_000_000).await;
        assert!(drained > 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.available() > 0);
        provider.shutdown();
    }

    #[tokio::test]
    async fn test_deregistered_limiter_stops_refilling() {
        let provider = BandwidthProvider::with_period(Duration::from_millis(20));
        let limiter = Arc::new(BandwidthLimiter::limited(0));
        let id = provider.register(limiter.clone(), 1000);
        provider.start();

        provider.deregister(id);
        assert_eq!(provider.registered_count(), 0);
        let _ = limiter.request_bandwidth(1_000_000).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(limiter.available(), 0);
        provider.shutdown();
    }

    #[tokio::test]
    async fn test_set_limit_bps() {
        let provider = BandwidthProvider::new();
        let limiter = Arc::new(BandwidthLimiter::limited(0));
        let id = provider.register(limiter.clone(), 100);
        assert_eq!(limiter.available(), 100);

        provider.set_limit_bps(id, 5000);
        assert_eq!(limiter.available(), 5000);

        provider.set_limit_bps(id, 0);
        assert!(limiter.is_unlimited());
    }

    #[tokio::test]
    async fn test_refill_wakes_parked_acquirer() {
        let provider = BandwidthProvider::with_period(Duration::from_millis(20));
        let limiter = Arc::new(BandwidthLimiter::limited(0));
        provider.register(limiter.clone(), 500);
        // Drain, then park a waiter; the timer must wake it
        let _ = limiter.request_bandwidth(1_000_000).await;
        provider.start();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.request_bandwidth(100).await })
        };
        let granted =
            tokio::time::timeout(Duration::from_millis(500), waiter).await;
        assert_eq!(granted.unwrap().unwrap(), 100);
        provider.shutdown();
    }
}
