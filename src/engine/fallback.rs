//! Escalation ladder configuration and the browser collaborator seam.
//!
//! The ladder never defeats protection; it retries with browser-shaped
//! headers, optionally asks an external renderer for cookies or a full render,
//! and refuses outright when a CAPTCHA shows up.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::config::FALLBACK_ON_STATUS;
use crate::engine::FetchMode;

/// Escalation strategy order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Header variation only (cheap, default).
    #[default]
    SecHeaders,
    /// Header variation, then cookie priming via the renderer.
    PrimeCookies,
    /// Header variation, then a full page render.
    RenderHtml,
}

/// Plan-level `http.fallback` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    /// Statuses that trigger escalation.
    pub on_status: Vec<u16>,
    /// Block hints (from the classifier vocabulary) that also trigger the
    /// renderer stages.
    pub on_hint: Vec<String>,
    /// Header-variation retries per attempt.
    pub max_tries: u32,
    pub strategy: FallbackStrategy,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            on_status: FALLBACK_ON_STATUS.to_vec(),
            on_hint: Vec::new(),
            max_tries: 1,
            strategy: FallbackStrategy::SecHeaders,
        }
    }
}

/// Browser-like client-hint and fetch-metadata headers for the given mode.
///
/// A soft nudge toward looking like a real browser tab; values do not need to
/// be perfect, only plausible.
pub fn sec_headers(mode: FetchMode) -> BTreeMap<String, String> {
    let mut h = BTreeMap::from([
        (
            "sec-ch-ua".to_string(),
            "\"Chromium\";v=\"131\", \"Google Chrome\";v=\"131\", \"Not(A:Brand\";v=\"99\""
                .to_string(),
        ),
        ("sec-ch-ua-mobile".to_string(), "?0".to_string()),
        ("sec-ch-ua-platform".to_string(), "\"Windows\"".to_string()),
    ]);
    if mode == FetchMode::Json {
        h.insert("sec-fetch-site".to_string(), "same-origin".to_string());
        h.insert("sec-fetch-mode".to_string(), "cors".to_string());
        h.insert("sec-fetch-dest".to_string(), "empty".to_string());
    } else {
        h.insert("sec-fetch-site".to_string(), "none".to_string());
        h.insert("sec-fetch-mode".to_string(), "navigate".to_string());
        h.insert("sec-fetch-dest".to_string(), "document".to_string());
        h.insert("sec-fetch-user".to_string(), "?1".to_string());
    }
    h
}

/// What a renderer produced for a URL.
#[derive(Clone, Debug)]
pub struct RenderOutcome {
    pub status: u16,
    pub final_url: String,
    pub html: String,
    /// Cookies harvested from the rendered session.
    pub cookies: Vec<(String, String)>,
    pub error: Option<String>,
}

/// External browser renderer, injected at engine construction.
///
/// The engine never spawns a browser itself; absence of a renderer simply
/// disables the heavier ladder steps.
pub trait BrowserRenderer: Send + Sync {
    fn render(&self, url: &str) -> BoxFuture<'_, RenderOutcome>;
}

/// CAPTCHA markers in rendered HTML. A hit is a refusal, never a bypass.
pub fn render_has_captcha(html: &str) -> bool {
    let lowered: String = html.chars().take(20_000).collect::<String>().to_ascii_lowercase();
    lowered.contains("g-recaptcha")
        || lowered.contains("hcaptcha")
        || lowered.contains("cf-turnstile")
        || lowered.contains("captcha")
}
