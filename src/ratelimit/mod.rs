//! Per-client token-bucket rate limiting.
//!
//! Buckets are created lazily on first sight of a client IP, start full and
//! refill lazily from elapsed clock time. A sweeper task drops buckets whose
//! client has been idle longer than the configured window.

mod middleware;

pub use middleware::{client_ip, enforce};

use chrono::{DateTime, Duration, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{sync::RwLock, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;

const DEFAULT_CAPACITY: u32 = 20;
const DEFAULT_REFILL_PER_SECOND: f64 = 10.0;
const DEFAULT_IDLE_SECONDS: i64 = 3 * 60;
const DEFAULT_SWEEP_SECONDS: u64 = 60;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    capacity: u32,
    refill_per_second: f64,
    idle_window: Duration,
    sweep_interval: std::time::Duration,
    trust_forwarded_for: bool,
}

impl RateLimitConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_per_second: DEFAULT_REFILL_PER_SECOND,
            idle_window: Duration::seconds(DEFAULT_IDLE_SECONDS),
            sweep_interval: std::time::Duration::from_secs(DEFAULT_SWEEP_SECONDS),
            trust_forwarded_for: false,
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Non-positive or non-finite rates fall back to the default.
    #[must_use]
    pub fn with_refill_per_second(mut self, rate: f64) -> Self {
        self.refill_per_second = if rate.is_finite() && rate > 0.0 {
            rate
        } else {
            DEFAULT_REFILL_PER_SECOND
        };
        self
    }

    #[must_use]
    pub fn with_idle_seconds(mut self, seconds: i64) -> Self {
        self.idle_window = Duration::seconds(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_sweep_interval_seconds(mut self, seconds: u64) -> Self {
        self.sweep_interval = std::time::Duration::from_secs(seconds.max(1));
        self
    }

    /// Key buckets on `X-Forwarded-For` instead of the peer address.
    /// Only safe behind a proxy that overwrites the header.
    #[must_use]
    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    #[must_use]
    pub fn idle_window(&self) -> Duration {
        self.idle_window
    }

    #[must_use]
    pub fn sweep_interval(&self) -> std::time::Duration {
        self.sweep_interval
    }

    #[must_use]
    pub fn trust_forwarded_for(&self) -> bool {
        self.trust_forwarded_for
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after_seconds: u64 },
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl Bucket {
    fn full(capacity: f64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, capacity: f64, rate: f64, now: DateTime<Utc>) {
        // a clock that moved backwards adds nothing
        let elapsed = (now - self.last_refill).to_std().unwrap_or_default();
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(capacity);
        self.last_refill = now;
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    visitors: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            visitors: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consume one token for `client` if one is available.
    pub async fn allow(&self, client: &str) -> bool {
        self.check(client).await == RateLimitDecision::Allowed
    }

    /// Like [`Self::allow`], also reporting how long until the next token.
    pub async fn check(&self, client: &str) -> RateLimitDecision {
        let bucket = self.bucket(client).await;
        let capacity = f64::from(self.config.capacity);
        let rate = self.config.refill_per_second;
        let now = self.clock.now();

        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.refill(capacity, rate, now);
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitDecision::Allowed
        } else {
            let wait = ((1.0 - bucket.tokens) / rate).ceil();
            // saturating float to int conversion
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let retry_after_seconds = (wait as u64).max(1);
            RateLimitDecision::Limited {
                retry_after_seconds,
            }
        }
    }

    async fn bucket(&self, client: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.visitors.read().await.get(client) {
            return Arc::clone(bucket);
        }

        let mut visitors = self.visitors.write().await;
        let capacity = f64::from(self.config.capacity);
        let now = self.clock.now();
        Arc::clone(
            visitors
                .entry(client.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Bucket::full(capacity, now)))),
        )
    }

    /// Number of clients currently tracked.
    pub async fn visitors(&self) -> usize {
        self.visitors.read().await.len()
    }

    /// Drop buckets idle for longer than the idle window. Returns how many.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let idle = self.config.idle_window;
        let mut visitors = self.visitors.write().await;
        let before = visitors.len();
        visitors.retain(|_, bucket| {
            let last_seen = bucket
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last_seen;
            now - last_seen <= idle
        });
        before - visitors.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = limiter.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        info!("rate limiter sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = limiter.sweep().await;
                        if removed > 0 {
                            debug!(removed, "evicted idle rate limit buckets");
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(capacity: u32, rate: f64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = RateLimitConfig::new()
            .with_capacity(capacity)
            .with_refill_per_second(rate)
            .with_idle_seconds(60);
        (RateLimiter::new(config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn burst_of_capacity_then_reject() {
        let (limiter, _clock) = limiter(5, 1.0);
        for _ in 0..5 {
            assert!(limiter.allow("10.0.0.1").await);
        }
        assert!(!limiter.allow("10.0.0.1").await);
    }

    #[tokio::test]
    async fn refills_after_one_over_rate() {
        let (limiter, clock) = limiter(2, 4.0);
        assert!(limiter.allow("10.0.0.1").await);
        assert!(limiter.allow("10.0.0.1").await);
        assert!(!limiter.allow("10.0.0.1").await);

        clock.advance(Duration::milliseconds(250));
        assert!(limiter.allow("10.0.0.1").await);
        assert!(!limiter.allow("10.0.0.1").await);
    }

    #[tokio::test]
    async fn refill_is_capped_at_capacity() {
        let (limiter, clock) = limiter(3, 10.0);
        assert!(limiter.allow("10.0.0.1").await);
        clock.advance(Duration::hours(1));
        for _ in 0..3 {
            assert!(limiter.allow("10.0.0.1").await);
        }
        assert!(!limiter.allow("10.0.0.1").await);
    }

    #[tokio::test]
    async fn rejection_reports_retry_after() {
        let (limiter, _clock) = limiter(1, 0.5);
        assert_eq!(limiter.check("10.0.0.1").await, RateLimitDecision::Allowed);
        assert_eq!(
            limiter.check("10.0.0.1").await,
            RateLimitDecision::Limited {
                retry_after_seconds: 2
            }
        );
    }

    #[tokio::test]
    async fn clients_are_independent() {
        let (limiter, _clock) = limiter(1, 1.0);
        assert!(limiter.allow("10.0.0.1").await);
        assert!(!limiter.allow("10.0.0.1").await);
        assert!(limiter.allow("10.0.0.2").await);
        assert_eq!(limiter.visitors().await, 2);
    }

    #[tokio::test]
    async fn sweep_drops_only_idle_visitors() {
        let (limiter, clock) = limiter(5, 1.0);
        limiter.allow("10.0.0.1").await;
        clock.advance(Duration::seconds(45));
        limiter.allow("10.0.0.2").await;
        clock.advance(Duration::seconds(30));

        assert_eq!(limiter.sweep().await, 1);
        assert_eq!(limiter.visitors().await, 1);

        // a swept visitor comes back with a full bucket
        for _ in 0..5 {
            assert!(limiter.allow("10.0.0.1").await);
        }
    }

    #[test]
    fn config_rejects_degenerate_values() {
        let config = RateLimitConfig::new()
            .with_capacity(0)
            .with_refill_per_second(f64::NAN);
        assert_eq!(config.capacity(), 1);
        assert!((config.refill_per_second() - DEFAULT_REFILL_PER_SECOND).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_idle_visitors_on_its_interval() {
        let clock = Arc::new(ManualClock::default());
        let config = RateLimitConfig::new()
            .with_idle_seconds(60)
            .with_sweep_interval_seconds(15);
        let limiter = Arc::new(RateLimiter::new(config, clock.clone()));
        limiter.allow("10.0.0.1").await;
        clock.advance(Duration::seconds(45));
        limiter.allow("10.0.0.2").await;
        clock.advance(Duration::seconds(30));

        let shutdown = CancellationToken::new();
        let handle = limiter.spawn_sweeper(shutdown.clone());
        tokio::task::yield_now().await;
        // idle buckets survive until the sweeper's next tick
        assert_eq!(limiter.visitors().await, 2);

        tokio::time::sleep(std::time::Duration::from_secs(16)).await;
        assert_eq!(limiter.visitors().await, 1);

        shutdown.cancel();
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let (limiter, _clock) = limiter(1, 1.0);
        let limiter = Arc::new(limiter);
        let shutdown = CancellationToken::new();
        let handle = limiter.spawn_sweeper(shutdown.clone());
        shutdown.cancel();
        assert!(handle.await.is_ok());
    }
}
