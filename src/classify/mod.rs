//! Heuristic detection of anti-bot walls and access blocks.
//!
//! This is a detector, not a bypass: it recognizes that a human (or fresh
//! credentials) is needed so the run can checkpoint, record the event and
//! stop cleanly.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use strum_macros::Display;

use crate::config::{BLOCK_KEEP_HEADERS, BLOCK_SCAN_CHARS, BLOCK_SNIPPET_CHARS};
use crate::engine::HttpResponse;

/// What kind of wall the response looks like.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BlockHint {
    Cloudflare,
    JsChallenge,
    Captcha,
    RateLimited,
    AuthRequired,
    AccessDenied,
    Blocked,
}

/// Evidence attached to a blocked-run event.
#[derive(Clone, Debug, Serialize)]
pub struct BlockEvent {
    pub hint: BlockHint,
    pub status: u16,
    pub final_url: String,
    /// Diagnostic subset of response headers, lowercased names.
    pub headers: BTreeMap<String, String>,
    /// Leading slice of the body, enough to eyeball the wall.
    pub snippet: String,
}

fn captcha_word() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bcaptcha\b").unwrap())
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Returns `None` when the response does not look like a block.
///
/// Only a bounded prefix of the body is scanned, so large payloads stay
/// cheap. When in doubt this does not guess: an ordinary 404 or a healthy
/// 200 never classifies.
pub fn classify_block(resp: &HttpResponse) -> Option<BlockEvent> {
    let sc = resp.status;
    let txt = truncate_chars(&resp.text_lossy(), BLOCK_SCAN_CHARS).to_lowercase();

    let server = resp
        .header("server")
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();

    let is_cf = resp.header("cf-ray").is_some()
        || server.contains("cloudflare")
        || txt.contains("__cf_bm")
        || txt.contains("cf-chl");
    let is_js = txt.contains("checking your browser")
        || txt.contains("just a moment")
        || txt.contains("verify you are human");
    let is_captcha =
        txt.contains("g-recaptcha") || txt.contains("hcaptcha") || captcha_word().is_match(&txt);
    let is_rate = sc == 429 || txt.contains("too many requests");
    let is_auth =
        sc == 401 || txt.contains("sign in") || txt.contains("log in") || txt.contains("authorization");
    let is_denied = sc == 403 || txt.contains("access denied") || txt.contains("forbidden");

    let mut hint = if is_cf {
        // Cloudflare pages often carry the more specific challenge too.
        if is_captcha {
            Some(BlockHint::Captcha)
        } else if is_js {
            Some(BlockHint::JsChallenge)
        } else {
            Some(BlockHint::Cloudflare)
        }
    } else if is_captcha {
        Some(BlockHint::Captcha)
    } else if is_js {
        Some(BlockHint::JsChallenge)
    } else if is_rate {
        Some(BlockHint::RateLimited)
    } else if is_auth {
        Some(BlockHint::AuthRequired)
    } else if is_denied {
        Some(BlockHint::AccessDenied)
    } else {
        None
    };

    // Challenge HTML served with a 200.
    if hint.is_none() && sc == 200 && (is_cf || is_js || is_captcha) {
        hint = Some(BlockHint::Blocked);
    }

    let hint = hint?;

    let headers = resp
        .headers
        .iter()
        .filter(|(k, _)| BLOCK_KEEP_HEADERS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Some(BlockEvent {
        hint,
        status: sc,
        final_url: resp.final_url.clone(),
        headers,
        snippet: truncate_chars(&resp.text_lossy(), BLOCK_SNIPPET_CHARS),
    })
}
