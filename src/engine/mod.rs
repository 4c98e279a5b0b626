//! Request engine: admission control, retry/backoff, the anti-block fallback
//! ladder, and the response cache, behind one `fetch` call.
//!
//! The engine is deliberately boring from the outside: callers hand it a
//! request, it hands back a `FetchOutcome`. Everything adversarial (waiting
//! out rate limits, honoring Retry-After, escalating through browser-shaped
//! retries, replaying from the cache) happens inside.

mod cache;
mod fallback;
pub mod payload;
mod response;
pub mod retry;

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::classify::classify_block;
use crate::limiter::LimiterRegistry;

pub use cache::{cache_key, CacheConfig, CacheKeyParts, ResponseCache};
pub use fallback::{
    render_has_captcha, sec_headers, BrowserRenderer, FallbackConfig, FallbackStrategy,
    RenderOutcome,
};
pub use response::{FetchError, FetchOutcome, HttpResponse, JsonOutcome};
pub use retry::{retry_after_seconds, Jitter, RetryPolicy};

use crate::config::{
    DEFAULT_HTML_ACCEPT, DEFAULT_JSON_ACCEPT, DEFAULT_TIMEOUT_SECS, RETRY_AFTER_CAP_FACTOR,
};

/// How a response body is expected to be consumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Json,
    Html,
    /// Decide per request from the body, Accept header and URL shape.
    #[default]
    Auto,
}

/// Plan-level `http.headers` section: a mode override plus per-mode extras
/// layered over the built-in Accept defaults.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct HeadersConfig {
    pub mode: Option<FetchMode>,
    pub json: BTreeMap<String, String>,
    pub html: BTreeMap<String, String>,
}

/// Credential injection seam.
///
/// Applied to every outgoing request (including ladder retries, whose headers
/// it may rewrite). Implementations receive the resolved URL and may mutate
/// query params and headers; they never read process environment here, the
/// hook itself was built with whatever secrets it needs.
pub trait AuthHook: Send + Sync {
    fn apply(
        &self,
        url: &str,
        params: &mut serde_json::Map<String, Value>,
        headers: &mut BTreeMap<String, String>,
    );
}

/// One request for the engine to execute.
#[derive(Clone, Debug, Default)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub params: serde_json::Map<String, Value>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
    pub expect: FetchMode,
}

fn looks_like_api_url(url: &str) -> bool {
    let u = url.to_ascii_lowercase();
    u.contains("/api/") || u.contains("graphql") || u.ends_with(".json") || u.contains("format=json")
}

fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_default()
}

fn param_value_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Single entry point for HTTP in the pipeline.
pub struct HttpEngine {
    client: reqwest::Client,
    default_timeout: Duration,
    default_headers: BTreeMap<String, String>,
    retry: RetryPolicy,
    limiters: LimiterRegistry,
    headers_cfg: HeadersConfig,
    fallback: FallbackConfig,
    renderer: Option<Box<dyn BrowserRenderer>>,
    auth_hook: Option<Box<dyn AuthHook>>,
    cache: Option<ResponseCache>,
    soft_errors: bool,
    /// Cookies primed by the fallback ladder, replayed on later requests.
    session_cookies: Mutex<BTreeMap<String, String>>,
}

impl HttpEngine {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            default_headers: BTreeMap::new(),
            retry: RetryPolicy::default(),
            limiters: LimiterRegistry::default(),
            headers_cfg: HeadersConfig::default(),
            fallback: FallbackConfig::default(),
            renderer: None,
            auth_hook: None,
            cache: None,
            soft_errors: true,
            session_cookies: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_default_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.default_headers = headers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_limiters(mut self, limiters: LimiterRegistry) -> Self {
        self.limiters = limiters;
        self
    }

    pub fn with_headers_cfg(mut self, cfg: HeadersConfig) -> Self {
        self.headers_cfg = cfg;
        self
    }

    pub fn with_fallback(mut self, cfg: FallbackConfig) -> Self {
        self.fallback = cfg;
        self
    }

    pub fn with_cache(mut self, cache: Option<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_renderer(mut self, renderer: Box<dyn BrowserRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_auth_hook(mut self, hook: Box<dyn AuthHook>) -> Self {
        self.auth_hook = Some(hook);
        self
    }

    pub fn with_soft_errors(mut self, enabled: bool) -> Self {
        self.soft_errors = enabled;
        self
    }

    /// Whether soft-error detection is on for this engine.
    pub fn soft_errors(&self) -> bool {
        self.soft_errors
    }

    fn resolve_mode(&self, url: &str, expect: FetchMode, body: Option<&Value>) -> FetchMode {
        // A plan-level headers.mode override beats the per-request expectation.
        let expect = self.headers_cfg.mode.unwrap_or(expect);
        match expect {
            FetchMode::Json => FetchMode::Json,
            FetchMode::Html => FetchMode::Html,
            FetchMode::Auto => {
                if body.is_some() {
                    return FetchMode::Json;
                }
                if self
                    .default_headers
                    .get("accept")
                    .map(|a| a.to_ascii_lowercase().contains("application/json"))
                    .unwrap_or(false)
                {
                    return FetchMode::Json;
                }
                if looks_like_api_url(url) {
                    FetchMode::Json
                } else {
                    FetchMode::Html
                }
            }
        }
    }

    /// Merge order: built-in Accept default, engine defaults, plan per-mode
    /// extras, then request headers. Later wins.
    fn merged_headers(
        &self,
        mode: FetchMode,
        request_headers: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let accept = if mode == FetchMode::Json {
            DEFAULT_JSON_ACCEPT
        } else {
            DEFAULT_HTML_ACCEPT
        };
        out.insert("accept".to_string(), accept.to_string());
        for (k, v) in &self.default_headers {
            out.insert(k.to_ascii_lowercase(), v.clone());
        }
        let extras = if mode == FetchMode::Json {
            &self.headers_cfg.json
        } else {
            &self.headers_cfg.html
        };
        for (k, v) in extras {
            out.insert(k.to_ascii_lowercase(), v.clone());
        }
        for (k, v) in request_headers {
            out.insert(k.to_ascii_lowercase(), v.clone());
        }
        out
    }

    fn cookie_header(&self) -> Option<String> {
        let cookies = self
            .session_cookies
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn prime_cookies(&self, cookies: &[(String, String)]) {
        let mut store = self
            .session_cookies
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for (k, v) in cookies {
            store.insert(k.clone(), v.clone());
        }
    }

    /// One wire round trip. The limiter has already been consulted.
    async fn send_once(
        &self,
        req: &FetchRequest,
        params: &serde_json::Map<String, Value>,
        headers: &BTreeMap<String, String>,
    ) -> Result<HttpResponse, FetchError> {
        let method = reqwest::Method::from_bytes(req.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| FetchError::Network(format!("bad method {}", req.method)))?;

        let query: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.clone(), param_value_str(v)))
            .collect();

        let mut builder = self
            .client
            .request(method, &req.url)
            .query(&query)
            .timeout(req.timeout.unwrap_or(self.default_timeout));

        for (k, v) in headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(cookie) = self.cookie_header() {
            builder = builder.header("cookie", cookie);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let result = builder.send().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(resp) => HttpResponse::from_reqwest(resp, elapsed_ms)
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        FetchError::Timeout
                    } else {
                        FetchError::Network(e.to_string())
                    }
                }),
            Err(e) if e.is_timeout() => Err(FetchError::Timeout),
            Err(e) => Err(FetchError::Network(e.to_string())),
        }
    }

    async fn admission_wait(&self, domain: &str) {
        let wait = self.limiters.for_domain(domain).acquire();
        if !wait.is_zero() {
            debug!("rate limit: waiting {:?} for {domain}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Walks the fallback ladder for a non-success response.
    ///
    /// Returns the best response obtained (which may be the original) and, for
    /// CAPTCHA or render failure, a terminal error the retry loop must not
    /// swallow.
    async fn escalate(
        &self,
        req: &FetchRequest,
        params: &serde_json::Map<String, Value>,
        headers: &BTreeMap<String, String>,
        mode: FetchMode,
        domain: &str,
        first: HttpResponse,
    ) -> (HttpResponse, Option<FetchError>) {
        let fb = &self.fallback;
        if !fb.enabled {
            return (first, None);
        }

        let mut current = first;

        // Step 1: retry with browser-shaped headers.
        let mut tries = 0;
        while fb.on_status.contains(&current.status) && tries < fb.max_tries {
            tries += 1;
            let mut fb_headers = headers.clone();
            fb_headers.extend(sec_headers(mode));
            let mut fb_params = params.clone();
            if let Some(hook) = &self.auth_hook {
                hook.apply(&req.url, &mut fb_params, &mut fb_headers);
            }
            self.admission_wait(domain).await;
            debug!("fallback: header variation try {tries} for {}", req.url);
            match self.send_once(req, &fb_params, &fb_headers).await {
                Ok(resp) => {
                    let improved = resp.is_success();
                    current = resp;
                    if improved {
                        return (current, None);
                    }
                    break;
                }
                Err(e) => {
                    warn!("fallback header retry failed for {}: {e}", req.url);
                    return (current, None);
                }
            }
        }

        // Steps 2-3 need the renderer; without one the ladder ends here.
        let Some(renderer) = &self.renderer else {
            return (current, None);
        };

        let hint = classify_block(&current).map(|e| e.hint.to_string());
        let triggered = fb.on_status.contains(&current.status)
            || hint
                .as_deref()
                .map(|h| fb.on_hint.iter().any(|x| x == h))
                .unwrap_or(false);
        if !triggered {
            return (current, None);
        }

        match fb.strategy {
            FallbackStrategy::SecHeaders => (current, None),
            FallbackStrategy::PrimeCookies => {
                debug!("fallback: priming cookies for {}", req.url);
                let render = renderer.render(&req.url).await;
                if let Some(e) = render.error {
                    return (current, Some(FetchError::RenderFailed(e)));
                }
                if render_has_captcha(&render.html) {
                    return (current, Some(FetchError::CaptchaDetected));
                }
                self.prime_cookies(&render.cookies);
                self.admission_wait(domain).await;
                match self.send_once(req, params, headers).await {
                    Ok(resp) => (resp, None),
                    Err(_) => (current, None),
                }
            }
            FallbackStrategy::RenderHtml => {
                debug!("fallback: full render for {}", req.url);
                let render = renderer.render(&req.url).await;
                if let Some(e) = render.error {
                    return (current, Some(FetchError::RenderFailed(e)));
                }
                if render_has_captcha(&render.html) {
                    return (current, Some(FetchError::CaptchaDetected));
                }
                let synthesized = HttpResponse {
                    status: render.status,
                    final_url: render.final_url,
                    headers: BTreeMap::from([(
                        "content-type".to_string(),
                        "text/html; charset=utf-8".to_string(),
                    )]),
                    body: render.html.into_bytes(),
                    elapsed_ms: 0,
                };
                (synthesized, None)
            }
        }
    }

    /// Executes a request: limiter wait, cache replay, retry loop with the
    /// fallback ladder threaded through, optional cache record.
    pub async fn fetch(&self, req: &FetchRequest) -> FetchOutcome {
        let domain = domain_of(&req.url);
        let mode = self.resolve_mode(&req.url, req.expect, req.body.as_ref());

        let mut params = req.params.clone();
        let mut headers = self.merged_headers(mode, &req.headers);
        if let Some(hook) = &self.auth_hook {
            hook.apply(&req.url, &mut params, &mut headers);
        }

        let mode_label = match mode {
            FetchMode::Json => "json",
            _ => "html",
        };
        let key = self.cache.as_ref().map(|_| {
            cache_key(&CacheKeyParts {
                method: &req.method,
                url: &req.url,
                params: &params,
                body: req.body.as_ref(),
                headers: &headers,
                mode: mode_label,
            })
        });

        if let (Some(cache), Some(key)) = (self.cache.as_ref(), key.as_deref()) {
            if cache.replay() {
                return match cache.load(key) {
                    Some(resp) => FetchOutcome::Success(resp),
                    None => FetchOutcome::Failed {
                        response: None,
                        error: FetchError::CacheMiss,
                    },
                };
            }
        }

        let mut last_err = FetchError::Network("request_failed".to_string());

        // Honored Retry-After waits repeat the same attempt number instead of
        // consuming one; courtesy_waits bounds a server that answers every
        // request with another Retry-After.
        let mut attempt: u32 = 1;
        let mut courtesy_waits: u32 = 0;
        while attempt <= self.retry.max_attempts {
            self.admission_wait(&domain).await;

            match self.send_once(req, &params, &headers).await {
                Ok(resp) if resp.is_success() => {
                    if let (Some(cache), Some(key)) = (self.cache.as_ref(), key.as_deref()) {
                        cache.save(key, &resp);
                    }
                    return FetchOutcome::Success(resp);
                }
                Ok(resp) => {
                    let (resp, terminal) = self
                        .escalate(req, &params, &headers, mode, &domain, resp)
                        .await;
                    if resp.is_success() {
                        if let (Some(cache), Some(key)) = (self.cache.as_ref(), key.as_deref()) {
                            cache.save(key, &resp);
                        }
                        return FetchOutcome::Success(resp);
                    }
                    if let Some(error) = terminal {
                        return FetchOutcome::Failed {
                            response: Some(resp),
                            error,
                        };
                    }

                    let status = resp.status;
                    last_err = FetchError::HttpStatus(status);
                    if !self.retry.is_retryable_status(status) || attempt >= self.retry.max_attempts
                    {
                        if let (Some(cache), Some(key)) = (self.cache.as_ref(), key.as_deref()) {
                            cache.save(key, &resp);
                        }
                        return FetchOutcome::Failed {
                            response: Some(resp),
                            error: last_err,
                        };
                    }

                    if self.retry.respect_retry_after && courtesy_waits < self.retry.max_attempts {
                        if let Some(ra) = retry_after_seconds(&resp) {
                            let cap = self.retry.cap_delay * f64::from(RETRY_AFTER_CAP_FACTOR);
                            let wait = ra.min(cap);
                            if wait < ra {
                                warn!(
                                    "Retry-After of {ra:.0}s from {} capped to {wait:.0}s",
                                    domain
                                );
                            }
                            debug!("honoring Retry-After: {wait:.1}s for {}", req.url);
                            courtesy_waits += 1;
                            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                            continue;
                        }
                    }

                    tokio::time::sleep(self.retry.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        "fetch attempt {attempt}/{} failed for {}: {e}",
                        self.retry.max_attempts, req.url
                    );
                    last_err = e;
                    if attempt >= self.retry.max_attempts {
                        break;
                    }
                    tokio::time::sleep(self.retry.backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }

        FetchOutcome::Failed {
            response: None,
            error: last_err,
        }
    }

    /// Like [`HttpEngine::fetch`] but validates the body as JSON.
    ///
    /// `force` parses bodies that do not look like JSON (use when the endpoint
    /// is known to speak JSON); soft-error detection follows the engine
    /// setting and every rejection is logged with the matched rule.
    pub async fn fetch_json(&self, req: &FetchRequest, force: bool) -> JsonOutcome {
        let mut req = req.clone();
        req.expect = FetchMode::Json;

        match self.fetch(&req).await {
            FetchOutcome::Failed { response, error } => JsonOutcome::Failed { response, error },
            FetchOutcome::Success(resp) => {
                match payload::read_json(&resp, force, self.soft_errors) {
                    Ok(data) => JsonOutcome::Success {
                        response: resp,
                        data,
                    },
                    Err(error) => {
                        if let FetchError::SoftError(rule) = &error {
                            warn!(
                                "soft error from {} ({rule}); preview: {}",
                                resp.final_url,
                                payload::preview(&resp.text_lossy())
                            );
                        }
                        JsonOutcome::Failed {
                            response: Some(resp),
                            error,
                        }
                    }
                }
            }
        }
    }
}
