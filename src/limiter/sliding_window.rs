//! Sliding window rate limiting.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::limiter::RateLimiter;

/// At most `max_requests` per rolling `window`. Smoother than a token bucket
/// for sites that count requests over fixed intervals.
pub struct SlidingWindow {
    max_requests: usize,
    window: Duration,
    stamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            stamps: Mutex::new(VecDeque::new()),
        }
    }
}

impl RateLimiter for SlidingWindow {
    fn acquire_at(&self, now: Instant) -> Duration {
        let mut stamps = self.stamps.lock().unwrap_or_else(|e| e.into_inner());

        while let Some(&front) = stamps.front() {
            if now.saturating_duration_since(front) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() < self.max_requests {
            stamps.push_back(now);
            return Duration::ZERO;
        }

        // A denied caller reserves its projected admission slot, so
        // concurrent waiters queue behind it instead of all admitting the
        // moment the oldest stamp expires.
        let idx = stamps.len() - self.max_requests;
        let admit_at = match stamps.get(idx) {
            Some(&stamp) => stamp + self.window,
            None => now,
        };
        stamps.push_back(admit_at);
        admit_at.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_then_waits() {
        let limiter = SlidingWindow::new(2, Duration::from_secs(1));
        let t0 = Instant::now();

        assert_eq!(limiter.acquire_at(t0), Duration::ZERO);
        assert_eq!(limiter.acquire_at(t0), Duration::ZERO);

        let wait = limiter.acquire_at(t0);
        assert!((wait.as_secs_f64() - 1.0).abs() < 1e-6, "wait={wait:?}");
    }

    #[test]
    fn expired_stamps_are_evicted() {
        let limiter = SlidingWindow::new(2, Duration::from_secs(1));
        let t0 = Instant::now();

        assert_eq!(limiter.acquire_at(t0), Duration::ZERO);
        assert_eq!(limiter.acquire_at(t0), Duration::ZERO);

        let t1 = t0 + Duration::from_millis(1_500);
        assert_eq!(limiter.acquire_at(t1), Duration::ZERO);
        assert_eq!(limiter.acquire_at(t1), Duration::ZERO);
    }

    #[test]
    fn denied_callers_queue_behind_reserved_slots() {
        let limiter = SlidingWindow::new(2, Duration::from_secs(10));
        let t0 = Instant::now();

        assert_eq!(limiter.acquire_at(t0), Duration::ZERO);
        assert_eq!(limiter.acquire_at(t0), Duration::ZERO);

        // a burst of three more: two take the slots freed at t0+10, the
        // third has to wait a full extra window
        let w3 = limiter.acquire_at(t0);
        let w4 = limiter.acquire_at(t0);
        let w5 = limiter.acquire_at(t0);
        assert!((w3.as_secs_f64() - 10.0).abs() < 1e-6, "w3={w3:?}");
        assert!((w4.as_secs_f64() - 10.0).abs() < 1e-6, "w4={w4:?}");
        assert!((w5.as_secs_f64() - 20.0).abs() < 1e-6, "w5={w5:?}");

        // once the reserved slots fill the window, a fresh arrival still
        // waits rather than admitting alongside them
        let t1 = t0 + Duration::from_secs(10);
        let w6 = limiter.acquire_at(t1);
        assert!((w6.as_secs_f64() - 10.0).abs() < 1e-6, "w6={w6:?}");
    }

    #[test]
    fn wait_shrinks_as_the_window_moves() {
        let limiter = SlidingWindow::new(1, Duration::from_secs(2));
        let t0 = Instant::now();

        assert_eq!(limiter.acquire_at(t0), Duration::ZERO);

        let t1 = t0 + Duration::from_millis(500);
        let wait = limiter.acquire_at(t1);
        assert!((wait.as_secs_f64() - 1.5).abs() < 1e-6, "wait={wait:?}");
    }
}
