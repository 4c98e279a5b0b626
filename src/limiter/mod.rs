//! Per-domain admission control.
//!
//! Every request asks a limiter how long to wait before being sent. Two
//! strategies are available (token bucket, sliding window), optionally wrapped
//! with minimum spacing and jitter. The registry hands out one limiter per
//! domain (or one shared limiter in global scope), matching configured rules
//! by exact domain or `.suffix` wildcard.

mod min_delay;
mod sliding_window;
mod token_bucket;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;

pub use min_delay::MinDelay;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

/// A rate limiting strategy: how long must this request wait?
///
/// `acquire` consumes capacity immediately (or reserves it), so the returned
/// wait must actually be slept; asking again without sleeping double-books.
pub trait RateLimiter: Send + Sync {
    /// Like [`RateLimiter::acquire`] but with an explicit clock, which keeps
    /// unit tests deterministic.
    fn acquire_at(&self, now: Instant) -> Duration;

    /// Returns how long to wait before sending the next request.
    fn acquire(&self) -> Duration {
        self.acquire_at(Instant::now())
    }
}

/// Limiter strategy selector in plan JSON.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    #[default]
    TokenBucket,
    SlidingWindow,
    /// No rate limiting for this scope.
    None,
}

/// One limiter rule, deserialized from a plan's `http.rate_limit` or
/// `http.limiters` entries.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub kind: LimiterKind,

    // token_bucket
    pub rate_per_sec: f64,
    pub capacity: f64,
    pub start_full: bool,

    // sliding_window
    pub max_requests: usize,
    pub window_sec: f64,

    // decorator
    pub min_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            kind: LimiterKind::TokenBucket,
            rate_per_sec: 1.0,
            capacity: 2.0,
            start_full: true,
            max_requests: 10,
            window_sec: 1.0,
            min_delay_ms: 0,
            jitter_ms: 0,
        }
    }
}

impl LimiterConfig {
    /// Builds a limiter instance from this rule.
    pub fn build(&self) -> Arc<dyn RateLimiter> {
        let inner: Arc<dyn RateLimiter> = match self.kind {
            LimiterKind::None => Arc::new(TokenBucket::unlimited()),
            LimiterKind::SlidingWindow => Arc::new(SlidingWindow::new(
                self.max_requests,
                Duration::from_secs_f64(self.window_sec.max(0.0)),
            )),
            LimiterKind::TokenBucket => Arc::new(TokenBucket::new(
                self.rate_per_sec,
                self.capacity,
                self.start_full,
            )),
        };

        if self.min_delay_ms > 0 || self.jitter_ms > 0 {
            Arc::new(MinDelay::new(
                inner,
                Duration::from_millis(self.min_delay_ms),
                Duration::from_millis(self.jitter_ms),
            ))
        } else {
            inner
        }
    }
}

/// Scope of a plan-level `rate_limit` rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterScope {
    /// Separate limiter per domain (default).
    #[default]
    Domain,
    /// One shared limiter for all domains.
    Global,
}

/// Plan-level `http.rate_limit` section: one rule plus its scope.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RateLimitConfig {
    #[serde(flatten)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub scope: LimiterScope,
}

/// Matches a configured domain rule against a request domain.
///
/// A rule starting with `.` matches any domain ending with the remainder;
/// anything else must match exactly. Comparison is case-insensitive.
fn match_domain(rule: &str, domain: &str) -> bool {
    let rule = rule.trim().to_ascii_lowercase();
    let domain = domain.trim().to_ascii_lowercase();
    if rule.is_empty() {
        return false;
    }
    if let Some(suffix) = rule.strip_prefix('.') {
        return domain.ends_with(suffix);
    }
    domain == rule
}

enum RegistrySource {
    /// `http.limiters`: per-domain rules plus a `"*"` default.
    Rules {
        rules: Vec<(String, LimiterConfig)>,
        fallback: LimiterConfig,
    },
    /// `http.rate_limit` with per-domain scope.
    PerDomain(LimiterConfig),
    /// `http.rate_limit` with global scope: one limiter shared by everyone.
    Shared(Arc<dyn RateLimiter>),
}

/// Hands out limiters per domain, creating them lazily and caching them for
/// the life of the engine.
pub struct LimiterRegistry {
    source: RegistrySource,
    cache: Mutex<HashMap<String, Arc<dyn RateLimiter>>>,
}

impl LimiterRegistry {
    /// Registry backed by explicit per-domain rules (`http.limiters`).
    ///
    /// Lookup order: exact domain match, then `.suffix`-style rules with the
    /// longest suffix winning, then the `"*"` entry, then the built-in
    /// default. Rule declaration order never matters.
    pub fn from_rules(rules: Vec<(String, LimiterConfig)>) -> Self {
        let fallback = rules
            .iter()
            .find(|(k, _)| k.as_str() == "*")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let rules = rules.into_iter().filter(|(k, _)| k.as_str() != "*").collect();
        Self {
            source: RegistrySource::Rules { rules, fallback },
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Registry backed by a single `rate_limit` rule.
    pub fn from_rate_limit(cfg: &RateLimitConfig) -> Self {
        let source = match cfg.scope {
            LimiterScope::Global => RegistrySource::Shared(cfg.limiter.build()),
            LimiterScope::Domain => RegistrySource::PerDomain(cfg.limiter.clone()),
        };
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the limiter for `domain`, creating it on first use.
    pub fn for_domain(&self, domain: &str) -> Arc<dyn RateLimiter> {
        if let RegistrySource::Shared(shared) = &self.source {
            return Arc::clone(shared);
        }

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = cache.get(domain) {
            return Arc::clone(existing);
        }

        let cfg = match &self.source {
            RegistrySource::PerDomain(cfg) => cfg.clone(),
            RegistrySource::Rules { rules, fallback } => rules
                .iter()
                .find(|(rule, _)| !rule.trim_start().starts_with('.') && match_domain(rule, domain))
                .or_else(|| {
                    rules
                        .iter()
                        .filter(|(rule, _)| {
                            rule.trim_start().starts_with('.') && match_domain(rule, domain)
                        })
                        .max_by_key(|(rule, _)| rule.trim().len())
                })
                .map(|(_, cfg)| cfg.clone())
                .unwrap_or_else(|| fallback.clone()),
            RegistrySource::Shared(_) => unreachable!(),
        };

        let limiter = cfg.build();
        cache.insert(domain.to_string(), Arc::clone(&limiter));
        limiter
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::from_rate_limit(&RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_rules_match_exact_and_suffix() {
        assert!(match_domain("api.example.com", "api.example.com"));
        assert!(match_domain("API.Example.com", "api.example.com"));
        assert!(!match_domain("api.example.com", "www.example.com"));
        assert!(match_domain(".example.com", "api.example.com"));
        assert!(match_domain(".example.com", "example.com"));
        assert!(!match_domain(".example.com", "example.org"));
        assert!(!match_domain("", "example.com"));
    }

    #[test]
    fn registry_caches_per_domain() {
        let registry = LimiterRegistry::from_rate_limit(&RateLimitConfig::default());
        let a1 = registry.for_domain("a.example.com");
        let a2 = registry.for_domain("a.example.com");
        let b = registry.for_domain("b.example.com");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[test]
    fn global_scope_shares_one_limiter() {
        let cfg = RateLimitConfig {
            limiter: LimiterConfig::default(),
            scope: LimiterScope::Global,
        };
        let registry = LimiterRegistry::from_rate_limit(&cfg);
        let a = registry.for_domain("a.example.com");
        let b = registry.for_domain("b.example.com");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn rules_prefer_exact_over_suffix_and_wildcard() {
        let tight = LimiterConfig {
            rate_per_sec: 0.1,
            capacity: 1.0,
            start_full: false,
            ..Default::default()
        };
        let registry = LimiterRegistry::from_rules(vec![
            ("api.example.com".to_string(), tight),
            (".example.com".to_string(), LimiterConfig::default()),
            ("*".to_string(), LimiterConfig::default()),
        ]);

        let t0 = Instant::now();
        // tight rule: empty bucket at 0.1 rps means a ten second wait
        let wait = registry.for_domain("api.example.com").acquire_at(t0);
        assert!(wait > Duration::from_secs(9), "wait={wait:?}");
        // suffix match gets the default full bucket
        assert_eq!(
            registry.for_domain("www.example.com").acquire_at(t0),
            Duration::ZERO
        );
        // unrelated domain falls through to the wildcard
        assert_eq!(
            registry.for_domain("other.org").acquire_at(t0),
            Duration::ZERO
        );
    }

    #[test]
    fn exact_rule_wins_even_when_a_suffix_rule_sorts_first() {
        // plan rules arrive from a sorted map, where ".example.com" sorts
        // before "api.example.com"
        let tight = LimiterConfig {
            rate_per_sec: 0.1,
            capacity: 1.0,
            start_full: false,
            ..Default::default()
        };
        let rules: std::collections::BTreeMap<String, LimiterConfig> =
            std::collections::BTreeMap::from([
                (".example.com".to_string(), LimiterConfig::default()),
                ("api.example.com".to_string(), tight),
            ]);
        let registry =
            LimiterRegistry::from_rules(rules.into_iter().collect());

        let t0 = Instant::now();
        let wait = registry.for_domain("api.example.com").acquire_at(t0);
        assert!(wait > Duration::from_secs(9), "wait={wait:?}");
        assert_eq!(
            registry.for_domain("www.example.com").acquire_at(t0),
            Duration::ZERO
        );
    }

    #[test]
    fn longest_suffix_rule_wins() {
        let tight = LimiterConfig {
            rate_per_sec: 0.1,
            capacity: 1.0,
            start_full: false,
            ..Default::default()
        };
        let registry = LimiterRegistry::from_rules(vec![
            (".example.com".to_string(), LimiterConfig::default()),
            (".api.example.com".to_string(), tight),
        ]);

        let t0 = Instant::now();
        let wait = registry.for_domain("v2.api.example.com").acquire_at(t0);
        assert!(wait > Duration::from_secs(9), "wait={wait:?}");
        assert_eq!(
            registry.for_domain("www.example.com").acquire_at(t0),
            Duration::ZERO
        );
    }

    #[test]
    fn limiter_config_parses_from_plan_json() {
        let cfg: LimiterConfig = serde_json::from_str(
            r#"{"kind":"sliding_window","max_requests":3,"window_sec":2.0,"min_delay_ms":250}"#,
        )
        .unwrap();
        assert_eq!(cfg.kind, LimiterKind::SlidingWindow);
        assert_eq!(cfg.max_requests, 3);
        assert_eq!(cfg.min_delay_ms, 250);
    }
}
