//! Retry and backoff policy.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::config::{
    RETRY_BASE_DELAY_SECS, RETRY_CAP_DELAY_SECS, RETRY_MAX_ATTEMPTS, RETRY_STATUSES,
};
use crate::engine::HttpResponse;

/// Jitter applied to backoff delays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Uniform over `[0, delay]` (decorrelates herds).
    #[default]
    Full,
    None,
}

/// Retry policy, deserialized from a plan's `http.retries` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base backoff delay in seconds.
    pub base_delay: f64,
    /// Backoff cap in seconds.
    pub cap_delay: f64,
    pub jitter: Jitter,
    pub retry_statuses: Vec<u16>,
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_delay: RETRY_BASE_DELAY_SECS,
            cap_delay: RETRY_CAP_DELAY_SECS,
            jitter: Jitter::Full,
            retry_statuses: RETRY_STATUSES.to_vec(),
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Exponential backoff for a 1-based attempt number, capped, jittered.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay * 2f64.powi(attempt.saturating_sub(1) as i32);
        let delay = exp.min(self.cap_delay).max(0.0);
        let delay = match self.jitter {
            Jitter::None => delay,
            Jitter::Full => {
                if delay > 0.0 {
                    rand::rng().random_range(0.0..delay)
                } else {
                    0.0
                }
            }
        };
        Duration::from_secs_f64(delay)
    }
}

/// Parses a `Retry-After` header into a wait in seconds.
///
/// Accepts delta-seconds and HTTP dates; anything non-positive or unparseable
/// is discarded.
pub fn retry_after_seconds(resp: &HttpResponse) -> Option<f64> {
    let raw = resp.header("retry-after")?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(secs) = raw.parse::<f64>() {
        return (secs > 0.0).then_some(secs);
    }

    let when = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let secs = (when.with_timezone(&chrono::Utc) - chrono::Utc::now()).num_milliseconds() as f64
        / 1000.0;
    (secs > 0.0).then_some(secs)
}
