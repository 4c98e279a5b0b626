//! Token bucket rate limiting.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::limiter::RateLimiter;

struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Token bucket: allows short bursts, then settles at the refill rate.
///
/// - `rate_per_sec` is how many tokens refill per second (the average rate)
/// - `capacity` is the bucket size (the burst allowance)
/// - `start_full` makes the first requests free of waiting
///
/// When the bucket is short, `acquire` reserves the fractional remainder and
/// returns how long the caller must wait, so concurrent callers cannot both
/// claim the same partial token.
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, capacity: f64, start_full: bool) -> Self {
        let tokens = if start_full { capacity } else { 0.0 };
        Self {
            rate_per_sec,
            capacity,
            state: Mutex::new(BucketState {
                tokens,
                last: Instant::now(),
            }),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(1e9, 1e9, true)
    }
}

impl RateLimiter for TokenBucket {
    fn acquire_at(&self, now: Instant) -> Duration {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = now.saturating_duration_since(st.last).as_secs_f64();
        st.last = now;

        st.tokens = (st.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            return Duration::ZERO;
        }

        let need = 1.0 - st.tokens;
        let wait = need / self.rate_per_sec.max(1e-9);
        st.tokens = 0.0; // the remainder is reserved for this caller
        Duration::from_secs_f64(wait.max(0.0))
    }
}
