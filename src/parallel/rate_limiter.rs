//! Token-bucket rate limiting for task starts.
//!
//! The engine can pace how fast workers begin calling a service, which keeps
//! a 20-worker fan-out from tripping account-level API rate limits before
//! the SDK retry policy even gets involved. The bucket itself is a `governor`
//! GCRA limiter; this module adds the bounded blocking wait workers use.

use crate::parallel::client::ConfigError;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 10.0;
pub const DEFAULT_BURST_SIZE: u32 = 20;
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    pub requests_per_second: f64,
    pub burst_size: u32,
    /// How long [`RateLimiter::acquire`] waits before giving up.
    pub wait_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst_size: DEFAULT_BURST_SIZE,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl RateLimiterConfig {
    pub fn new(
        requests_per_second: f64,
        burst_size: u32,
        wait_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            requests_per_second,
            burst_size,
            wait_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.requests_per_second > 0.0 && self.requests_per_second.is_finite()) {
            return Err(ConfigError::InvalidRateLimit("requests_per_second must be > 0"));
        }
        if self.burst_size == 0 {
            return Err(ConfigError::InvalidRateLimit("burst_size must be > 0"));
        }
        Ok(())
    }

    /// Preset for a service; unknown services get the default.
    pub fn for_service(service: &str) -> Self {
        let (rps, burst) = match service {
            "ec2" => (20.0, 40),
            "iam" => (10.0, 20),
            "organizations" => (5.0, 10),
            "sts" => (10.0, 20),
            "service-quotas" | "servicequotas" => (5.0, 10),
            _ => (DEFAULT_REQUESTS_PER_SECOND, DEFAULT_BURST_SIZE),
        };
        Self {
            requests_per_second: rps,
            burst_size: burst,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// `governor` quota for a validated config.
fn quota(config: &RateLimiterConfig) -> Result<Quota, ConfigError> {
    config.validate()?;
    let out_of_range = ConfigError::InvalidRateLimit("requests_per_second is out of range");
    let period = Duration::try_from_secs_f64(1.0 / config.requests_per_second)
        .map_err(|_| out_of_range.clone())?;
    let burst = NonZeroU32::new(config.burst_size)
        .ok_or(ConfigError::InvalidRateLimit("burst_size must be > 0"))?;
    Quota::with_period(period)
        .map(|quota| quota.allow_burst(burst))
        .ok_or(out_of_range)
}

/// Thread-safe token bucket. Starts full.
pub struct RateLimiter {
    config: RateLimiterConfig,
    limiter: DirectLimiter,
    clock: DefaultClock,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self, ConfigError> {
        let quota = quota(&config)?;
        Ok(Self::with_quota(config, quota))
    }

    fn with_quota(config: RateLimiterConfig, quota: Quota) -> Self {
        let clock = DefaultClock::default();
        Self {
            config,
            limiter: governor::RateLimiter::direct_with_clock(quota, &clock),
            clock,
        }
    }

    pub fn for_service(service: &str) -> Self {
        let config = RateLimiterConfig::for_service(service);
        // presets are always valid; one request per second otherwise
        let quota = quota(&config).unwrap_or_else(|_| Quota::per_second(NonZeroU32::MIN));
        Self::with_quota(config, quota)
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Take `n` tokens if available right now.
    ///
    /// Asking for more than the burst size always fails.
    pub fn try_acquire(&self, n: u32) -> bool {
        match NonZeroU32::new(n) {
            Some(n) => matches!(self.limiter.check_n(n), Ok(Ok(()))),
            None => true,
        }
    }

    /// Take one token, waiting up to the configured timeout.
    pub fn acquire(&self) -> bool {
        self.acquire_timeout(self.config.wait_timeout)
    }

    /// Take one token, waiting up to `timeout`.
    ///
    /// Gives up without sleeping when the next token is due after the
    /// deadline.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            let wait = match self.limiter.check() {
                Ok(()) => return true,
                Err(not_until) => not_until.wait_time_from(self.clock.now()),
            };
            if wait > timeout.saturating_sub(start.elapsed()) {
                return false;
            }
            thread::sleep(wait);
        }
    }
}

/// One limiter per service, created on first use.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, service: &str) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            limiters
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(RateLimiter::for_service(service))),
        )
    }

    pub fn reset(&self) {
        self.limiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rps: f64, burst: u32, timeout_ms: u64) -> RateLimiter {
        RateLimiter::new(
            RateLimiterConfig::new(rps, burst, Duration::from_millis(timeout_ms)).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.requests_per_second, 10.0);
        assert_eq!(config.burst_size, 20);
        assert_eq!(config.wait_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_config() {
        assert!(RateLimiterConfig::new(0.0, 10, DEFAULT_WAIT_TIMEOUT).is_err());
        assert!(RateLimiterConfig::new(-1.0, 10, DEFAULT_WAIT_TIMEOUT).is_err());
        assert!(RateLimiterConfig::new(5.0, 0, DEFAULT_WAIT_TIMEOUT).is_err());
    }

    #[test]
    fn test_service_presets() {
        assert_eq!(RateLimiterConfig::for_service("ec2").burst_size, 40);
        assert_eq!(RateLimiterConfig::for_service("iam").requests_per_second, 10.0);
        assert!(RateLimiterConfig::for_service("organizations").requests_per_second <= 5.0);
        assert_eq!(
            RateLimiterConfig::for_service("unknown_service"),
            RateLimiterConfig::default()
        );
    }

    #[test]
    fn test_starts_full_and_drains() {
        let limiter = limiter(0.1, 2, 10);
        assert!(limiter.try_acquire(2));
        assert!(!limiter.try_acquire(1));
        assert!(limiter.try_acquire(0));
    }

    #[test]
    fn test_rate_out_of_range() {
        let config = RateLimiterConfig::new(1e-300, 1, DEFAULT_WAIT_TIMEOUT).unwrap();
        assert!(RateLimiter::new(config).is_err());
    }

    #[test]
    fn test_acquire_times_out() {
        let limiter = limiter(0.1, 1, 50);
        assert!(limiter.acquire());

        let start = Instant::now();
        assert!(!limiter.acquire());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_acquire_waits_for_refill() {
        let limiter = limiter(50.0, 1, 1000);
        assert!(limiter.acquire());
        assert!(limiter.acquire());
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let limiter = limiter(1000.0, 5, 10);
        thread::sleep(Duration::from_millis(20));
        assert!(!limiter.try_acquire(6));
        assert!(limiter.try_acquire(5));
    }

    #[test]
    fn test_registry_reuses_limiters() {
        let registry = RateLimiterRegistry::new();
        let a = registry.get("ec2");
        let b = registry.get("ec2");
        let c = registry.get("iam");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        registry.reset();
        assert!(!Arc::ptr_eq(&a, &registry.get("ec2")));
    }
}
