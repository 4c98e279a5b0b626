//! Fetch plans: the JSON "tech card" describing one site walk. The plan is
//! declarative; all guessing happened before it was written. Loading a plan
//! and building its engine are the only operations here.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::{DEFAULT_MAX_BATCHES, DEFAULT_TIMEOUT_SECS};
use crate::engine::{
    CacheConfig, FallbackConfig, HeadersConfig, HttpEngine, ResponseCache, RetryPolicy,
};
use crate::extract::ExtractSpec;
use crate::limiter::{LimiterConfig, LimiterRegistry, RateLimitConfig};
use crate::paginate::PaginationKind;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse plan {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("plan {path} has no url")]
    MissingUrl { path: String },
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT_SECS as f64
}

fn default_limit() -> u32 {
    20
}

fn default_max_batches() -> u32 {
    DEFAULT_MAX_BATCHES
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_start_from() -> i64 {
    1
}

fn default_offset_param() -> String {
    "offset".to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PaginationSpec {
    pub kind: PaginationKind,
    pub limit: u32,
    /// Param name carrying the page size; absent means the API has none.
    pub limit_param: Option<String>,
    pub max_batches: u32,
    pub page_param: String,
    pub start_from: i64,
    pub offset_param: String,
    /// Offset increment; 0 means derive from `limit` or the batch size.
    pub step: i64,
    pub cursor_param: Option<String>,
}

impl Default for PaginationSpec {
    fn default() -> Self {
        Self {
            kind: PaginationKind::default(),
            limit: default_limit(),
            limit_param: None,
            max_batches: default_max_batches(),
            page_param: default_page_param(),
            start_from: default_start_from(),
            offset_param: default_offset_param(),
            step: 0,
            cursor_param: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// The plan's `http` section: everything the engine needs beyond the URL.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct HttpOptions {
    /// Single-rule limiter, the common case.
    pub rate_limit: Option<RateLimitConfig>,
    /// Per-domain rules; keys are domains, `.suffix` patterns or `"*"`.
    pub limiters: Option<BTreeMap<String, LimiterConfig>>,
    pub retries: RetryPolicy,
    pub headers: HeadersConfig,
    pub fallback: FallbackConfig,
    #[serde(default = "default_true")]
    pub soft_errors: bool,
    pub cache: CacheConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FetchPlan {
    /// Profile name; defaults to the URL's host.
    pub name: String,
    pub url: String,
    pub method: String,
    /// Per-request timeout in seconds.
    pub timeout: f64,
    pub headers: BTreeMap<String, String>,
    /// Query params sent with every page request.
    pub base_params: serde_json::Map<String, Value>,
    pub pagination: PaginationSpec,
    pub extract: ExtractSpec,
    pub http: HttpOptions,
}

impl Default for FetchPlan {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            method: default_method(),
            timeout: default_timeout(),
            headers: BTreeMap::new(),
            base_params: serde_json::Map::new(),
            pagination: PaginationSpec::default(),
            extract: ExtractSpec::default(),
            http: HttpOptions::default(),
        }
    }
}

impl FetchPlan {
    fn limiters(&self) -> LimiterRegistry {
        if let Some(rules) = &self.http.limiters {
            let rules: Vec<(String, LimiterConfig)> = rules
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            return LimiterRegistry::from_rules(rules);
        }
        if let Some(rate_limit) = &self.http.rate_limit {
            return LimiterRegistry::from_rate_limit(rate_limit);
        }
        LimiterRegistry::default()
    }

    /// Assembles the engine this plan describes around an existing client.
    pub fn build_engine(&self, client: reqwest::Client) -> HttpEngine {
        HttpEngine::new(client)
            .with_default_timeout(Duration::from_secs_f64(self.timeout))
            .with_default_headers(self.headers.clone())
            .with_retry(self.http.retries.clone())
            .with_limiters(self.limiters())
            .with_headers_cfg(self.http.headers.clone())
            .with_fallback(self.http.fallback.clone())
            .with_soft_errors(self.http.soft_errors)
            .with_cache(ResponseCache::new(&self.http.cache))
    }
}

/// Reads and validates a plan file.
pub fn load_plan(path: &Path) -> Result<FetchPlan, PlanError> {
    let shown = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|source| PlanError::Io {
        path: shown.clone(),
        source,
    })?;
    let mut plan: FetchPlan = serde_json::from_str(&text).map_err(|source| PlanError::Parse {
        path: shown.clone(),
        source,
    })?;
    if plan.url.trim().is_empty() {
        return Err(PlanError::MissingUrl { path: shown });
    }
    if plan.name.trim().is_empty() {
        plan.name = Url::parse(&plan.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "default".to_string());
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn minimal_plan_fills_defaults() {
        let plan: FetchPlan =
            serde_json::from_value(json!({"url": "https://shop.example.com/api/items"})).unwrap();
        assert_eq!(plan.method, "GET");
        assert_eq!(plan.timeout, 10.0);
        assert_eq!(plan.pagination.kind, PaginationKind::Unknown);
        assert_eq!(plan.pagination.limit, 20);
        assert_eq!(plan.pagination.max_batches, 200);
        assert_eq!(plan.pagination.page_param, "page");
        assert_eq!(plan.pagination.start_from, 1);
        assert!(plan.http.soft_errors);
        assert!(!plan.http.fallback.enabled);
    }

    #[test]
    fn load_plan_defaults_name_to_host() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, r#"{{"url": "https://shop.example.com/api/items"}}"#).unwrap();
        let plan = load_plan(f.path()).unwrap();
        assert_eq!(plan.name, "shop.example.com");
    }

    #[test]
    fn load_plan_rejects_missing_url() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, r#"{{"name": "x"}}"#).unwrap();
        let err = load_plan(f.path()).unwrap_err();
        assert!(matches!(err, PlanError::MissingUrl { .. }));
    }

    #[test]
    fn load_plan_reports_parse_errors() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "not json").unwrap();
        let err = load_plan(f.path()).unwrap_err();
        assert!(matches!(err, PlanError::Parse { .. }));
    }

    #[test]
    fn http_section_round_trips() {
        let plan: FetchPlan = serde_json::from_value(json!({
            "url": "https://shop.example.com/api/items",
            "http": {
                "rate_limit": {"kind": "token_bucket", "rate_per_sec": 3.0, "scope": "global"},
                "retries": {"max_attempts": 2},
                "fallback": {"enabled": true, "on_status": [403], "strategy": "sec_headers"},
                "soft_errors": false
            }
        }))
        .unwrap();
        assert!(plan.http.rate_limit.is_some());
        assert_eq!(plan.http.retries.max_attempts, 2);
        assert!(plan.http.fallback.enabled);
        assert!(!plan.http.soft_errors);
    }
}
