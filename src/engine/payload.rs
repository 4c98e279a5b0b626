//! Safe payload reading.
//!
//! Real APIs lie: 200 with an HTML ban page, JSON behind an XSSI prefix, a
//! perfectly valid body that says `"success": false`. This module turns a raw
//! response body into a parsed JSON value without trusting any of that, and
//! classifies the ways it can go wrong.

use serde_json::Value;

use crate::config::PAYLOAD_PREVIEW_CHARS;
use crate::engine::{FetchError, HttpResponse};

const XSSI_PREFIXES: [&str; 4] = [")]}'", "while(1);", "for(;;);", "throw 1;"];

/// Content types we refuse to treat as text at all.
pub fn is_binary_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("image/")
        || ct.contains("pdf")
        || ct.contains("zip")
        || ct.contains("octet-stream")
        || ct.contains("application/gzip")
}

/// Strips a leading XSSI guard.
///
/// If the prefix sits on its own line (the usual case) the whole first line
/// goes; otherwise just the prefix itself.
pub fn strip_xssi_prefix(text: &str) -> &str {
    let t = text.trim_start();
    for prefix in XSSI_PREFIXES {
        if let Some(rest) = t.strip_prefix(prefix) {
            if let Some(nl) = rest.find('\n') {
                return &rest[nl + 1..];
            }
            return rest;
        }
    }
    text
}

fn strip_bom(text: &str) -> &str {
    text.trim_start_matches('\u{feff}')
}

/// Does this look like JSON? Either the content type says so, or the cleaned
/// body starts with `{` or `[`.
pub fn looks_like_json(content_type: &str, text: &str) -> bool {
    if content_type.to_ascii_lowercase().contains("json") {
        return true;
    }
    let s = strip_bom(strip_xssi_prefix(text)).trim_start();
    matches!(s.as_bytes().first(), Some(b'{') | Some(b'['))
}

/// Application-level failure inside an HTTP 200.
///
/// Checked conservatively, in order: non-empty `error`/`errors`, falsy
/// `success`, `status` of error/fail, and a `message` that plainly reads like
/// an error. Returns the matched rule for logging.
pub fn detect_soft_error(data: &Value) -> Option<String> {
    let obj = data.as_object()?;

    if let Some(err) = obj.get("error") {
        match err {
            Value::String(s) if !s.trim().is_empty() => {
                return Some(format!("error: {}", s.trim()));
            }
            Value::Object(m) if !m.is_empty() => return Some("error: non-empty".to_string()),
            Value::Array(a) if !a.is_empty() => return Some("error: non-empty".to_string()),
            _ => {}
        }
    }
    if let Some(errs) = obj.get("errors") {
        match errs {
            Value::Array(a) if !a.is_empty() => return Some("errors: non-empty list".to_string()),
            Value::Object(m) if !m.is_empty() => return Some("errors: non-empty dict".to_string()),
            _ => {}
        }
    }

    match obj.get("success") {
        Some(Value::Bool(false)) => return Some("success=false".to_string()),
        Some(Value::String(s)) => {
            let lowered = s.trim().to_ascii_lowercase();
            if matches!(lowered.as_str(), "false" | "0" | "no" | "fail" | "failed") {
                return Some(format!("success={s}"));
            }
        }
        _ => {}
    }

    if let Some(Value::String(status)) = obj.get("status") {
        let lowered = status.trim().to_ascii_lowercase();
        if matches!(lowered.as_str(), "error" | "fail" | "failed") {
            return Some(format!("status={}", status.trim()));
        }
    }

    if let Some(Value::String(msg)) = obj.get("message") {
        let lowered = msg.trim().to_ascii_lowercase();
        if lowered.starts_with("error")
            || lowered.contains("permission denied")
            || lowered.contains("unauthorized")
        {
            return Some(format!("message={}", msg.trim()));
        }
    }

    None
}

/// Bounded single-line preview for logs and error details.
pub fn preview(text: &str) -> String {
    text.chars()
        .take(PAYLOAD_PREVIEW_CHARS)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect()
}

/// Reads a response body as JSON.
///
/// - binary content types are rejected outright
/// - unless `force` is set, bodies that do not look like JSON fail as
///   `NotJson` instead of producing a decode error on every ban page
/// - with `detect_soft`, application-level failures fail as `SoftError`
pub fn read_json(resp: &HttpResponse, force: bool, detect_soft: bool) -> Result<Value, FetchError> {
    let content_type = resp.content_type().to_string();
    if is_binary_content_type(&content_type) {
        return Err(FetchError::BinaryPayload(content_type));
    }

    let text = resp.text_lossy();
    if !force && !looks_like_json(&content_type, &text) {
        return Err(FetchError::NotJson(preview(&text)));
    }

    let cleaned = strip_bom(strip_xssi_prefix(&text)).trim_start();
    let data: Value = serde_json::from_str(cleaned)
        .map_err(|e| FetchError::JsonDecode(format!("{e}; preview: {}", preview(&text))))?;

    if detect_soft {
        if let Some(rule) = detect_soft_error(&data) {
            return Err(FetchError::SoftError(rule));
        }
    }

    Ok(data)
}
