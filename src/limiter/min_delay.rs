//! Minimum spacing and jitter over an inner limiter.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::limiter::RateLimiter;

/// Decorator adding a minimum gap between requests plus uniform jitter.
///
/// `wait = max(inner_wait, time_until_allowed) + uniform(0..jitter)`, and the
/// next request is not allowed before `now + wait + min_delay`.
pub struct MinDelay {
    inner: Arc<dyn RateLimiter>,
    min_delay: Duration,
    jitter: Duration,
    next_allowed: Mutex<Option<Instant>>,
}

impl MinDelay {
    pub fn new(inner: Arc<dyn RateLimiter>, min_delay: Duration, jitter: Duration) -> Self {
        Self {
            inner,
            min_delay,
            jitter,
            next_allowed: Mutex::new(None),
        }
    }
}

impl RateLimiter for MinDelay {
    fn acquire_at(&self, now: Instant) -> Duration {
        let inner_wait = self.inner.acquire_at(now);

        let mut next_allowed = self.next_allowed.lock().unwrap_or_else(|e| e.into_inner());
        let spacing_wait = match *next_allowed {
            Some(at) => at.saturating_duration_since(now),
            None => Duration::ZERO,
        };

        let mut wait = inner_wait.max(spacing_wait);
        if !self.jitter.is_zero() {
            let extra = rand::rng().random_range(0.0..self.jitter.as_secs_f64());
            wait += Duration::from_secs_f64(extra);
        }

        *next_allowed = Some(now + wait + self.min_delay);
        wait
    }
}
