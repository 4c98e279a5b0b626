//! Response value type and fetch outcomes.
//!
//! `HttpResponse` is an immutable snapshot of an HTTP exchange, shared by the
//! engine, the cache and the block classifier. It is the only response shape
//! in the crate; replayed cache entries and synthesized browser renders look
//! exactly like live responses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Immutable HTTP response snapshot.
///
/// Header names are lowercased on construction so lookups never care about
/// wire casing. `final_url` is the URL after redirects.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub final_url: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip)]
    pub body: Vec<u8>,
    pub elapsed_ms: u64,
}

impl HttpResponse {
    /// Builds a snapshot from a live reqwest response, consuming its body.
    pub async fn from_reqwest(
        resp: reqwest::Response,
        elapsed_ms: u64,
    ) -> Result<Self, reqwest::Error> {
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let mut headers = BTreeMap::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }
        let body = resp.bytes().await?.to_vec();
        Ok(Self {
            status,
            final_url,
            headers,
            body,
            elapsed_ms,
        })
    }

    /// Header lookup by lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// 2xx and 3xx count as success; redirects were already followed, so a
    /// remaining 3xx (e.g. 304 from the cache) carries a usable body decision.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Typed fetch failures.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("timeout")]
    Timeout,

    #[error("network_error:{0}")]
    Network(String),

    #[error("http_{0}")]
    HttpStatus(u16),

    /// Replay mode and the request was never recorded.
    #[error("cache_miss")]
    CacheMiss,

    /// The rendered page presented a CAPTCHA; the ladder refuses to go further.
    #[error("captcha_detected")]
    CaptchaDetected,

    #[error("render_failed:{0}")]
    RenderFailed(String),

    // Payload-level failures (fetch_json only)
    #[error("not_json:{0}")]
    NotJson(String),

    #[error("json_decode_error:{0}")]
    JsonDecode(String),

    #[error("binary:{0}")]
    BinaryPayload(String),

    /// HTTP said 200 but the body says the application failed.
    #[error("soft_error:{0}")]
    SoftError(String),
}

/// Result of `HttpEngine::fetch`: a successful response or a typed failure.
///
/// Never both. A failure may still carry the last response received so the
/// block classifier can inspect it.
#[derive(Debug)]
pub enum FetchOutcome {
    Success(HttpResponse),
    Failed {
        response: Option<HttpResponse>,
        error: FetchError,
    },
}

impl FetchOutcome {
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            FetchOutcome::Success(r) => Some(r),
            FetchOutcome::Failed { response, .. } => response.as_ref(),
        }
    }
}

/// Result of `HttpEngine::fetch_json`: a parsed payload alongside its
/// response, or a typed failure.
#[derive(Debug)]
pub enum JsonOutcome {
    Success {
        response: HttpResponse,
        data: serde_json::Value,
    },
    Failed {
        response: Option<HttpResponse>,
        error: FetchError,
    },
}
