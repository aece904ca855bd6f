//! Per-IP token bucket rate limiting and consecutive-failure account lockout (§4.9, §5).

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Keyed token buckets, one per (IP, operation class). §4.9: 5/hour per IP for activation,
/// 100/hour per IP for status checks.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn per_hour(capacity: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: capacity as f64 / 3600.0,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn activation() -> Self {
        Self::per_hour(5)
    }

    pub fn status() -> Self {
        Self::per_hour(100)
    }

    /// `Ok(())` if allowed; `Err(retry_after)` otherwise.
    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(ip)
            .or_insert_with(|| Bucket::new(self.capacity, self.refill_per_sec));
        bucket.try_take()
    }
}

struct LockoutState {
    consecutive_failures: u32,
    locked_until: Option<Instant>,
}

/// 5 consecutive failed activations trigger exponential backoff (15m, 30m, 1h, ...) per IP
/// (§4.9 Account lockout).
pub struct AccountLockout {
    states: Mutex<HashMap<IpAddr, LockoutState>>,
}

impl Default for AccountLockout {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountLockout {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    /// `Some(remaining)` if currently locked out, else `None`.
    pub fn check(&self, ip: IpAddr) -> Option<Duration> {
        let states = self.states.lock();
        let state = states.get(&ip)?;
        let until = state.locked_until?;
        let now = Instant::now();
        if now < until {
            Some(until - now)
        } else {
            None
        }
    }

    pub fn record_failure(&self, ip: IpAddr) {
        let mut states = self.states.lock();
        let state = states.entry(ip).or_insert(LockoutState {
            consecutive_failures: 0,
            locked_until: None,
        });
        state.consecutive_failures += 1;
        if state.consecutive_failures >= 5 {
            let tier = state.consecutive_failures - 5;
            let minutes = 15u64 * 2u64.pow(tier.min(10));
            state.locked_until = Some(Instant::now() + Duration::from_secs(minutes * 60));
        }
    }

    pub fn record_success(&self, ip: IpAddr) {
        self.states.lock().remove(&ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[test]
    fn token_bucket_allows_up_to_capacity_then_rejects() {
        let limiter = RateLimiter::per_hour(5);
        for _ in 0..5 {
            assert!(limiter.check(ip()).is_ok());
        }
        assert!(limiter.check(ip()).is_err());
    }

    #[test]
    fn lockout_triggers_after_five_failures() {
        let lockout = AccountLockout::new();
        for _ in 0..4 {
            lockout.record_failure(ip());
            assert!(lockout.check(ip()).is_none());
        }
        lockout.record_failure(ip());
        assert!(lockout.check(ip()).is_some());
    }

    #[test]
    fn success_clears_lockout_state() {
        let lockout = AccountLockout::new();
        for _ in 0..5 {
            lockout.record_failure(ip());
        }
        assert!(lockout.check(ip()).is_some());
        lockout.record_success(ip());
        assert!(lockout.check(ip()).is_none());
    }
}
