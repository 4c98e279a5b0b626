//! Next-page discovery from a response already in hand: the `Link` header,
//! well-known JSON paths for next URLs and cursor tokens. No HTTP here.

use std::collections::BTreeMap;

use serde_json::Value;
use url::Url;

fn looks_like_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Parses `Link: <url>; rel="next", <url2>; rel="prev"` and returns the
/// `next` target, if any. Header names are expected lowercased.
pub fn parse_link_next(headers: &BTreeMap<String, String>) -> Option<String> {
    let link = headers.get("link")?;
    for part in link.split(',') {
        let part = part.trim();
        let url_start = part.find('<')?;
        let url_end = part.find('>')?;
        if url_end <= url_start {
            continue;
        }
        let url = part[url_start + 1..url_end].trim();
        let rel = part
            .split(';')
            .skip(1)
            .find_map(|attr| {
                let attr = attr.trim();
                attr.strip_prefix("rel=")
                    .map(|v| v.trim_matches('"').to_ascii_lowercase())
            })
            .unwrap_or_default();
        if rel == "next" {
            return Some(url.to_string());
        }
    }
    None
}

/// Dot-path lookup; numeric segments index arrays.
pub fn get_by_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = data;
    for seg in path.split('.') {
        cur = match cur {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

const NEXT_URL_PATHS: &[&str] = &[
    "next",
    "next_url",
    "nextUrl",
    "links.next",
    "paging.next",
    "pagination.next",
    "page.next",
];

/// Absolute next URL from the typical JSON envelope shapes.
pub fn extract_next_url(data: &Value) -> Option<String> {
    if !data.is_object() {
        return None;
    }
    for path in NEXT_URL_PATHS {
        if let Some(Value::String(s)) = get_by_path(data, path) {
            if looks_like_url(s) {
                return Some(s.clone());
            }
        }
    }
    // sometimes next is an object like {"href": "..."} or {"url": "..."}
    for path in NEXT_URL_PATHS {
        if let Some(Value::Object(map)) = get_by_path(data, path) {
            for key in ["href", "url"] {
                if let Some(Value::String(s)) = map.get(key) {
                    if looks_like_url(s) {
                        return Some(s.clone());
                    }
                }
            }
        }
    }
    None
}

const CURSOR_PATHS: &[&str] = &[
    "next_cursor",
    "nextCursor",
    "cursor",
    "cursor.next",
    "page_info.end_cursor",
    "pageInfo.endCursor",
    "meta.cursor",
];

/// Opaque continuation token from the typical JSON paths. Numeric cursors
/// are rendered as strings.
pub fn extract_cursor_token(data: &Value) -> Option<String> {
    if !data.is_object() {
        return None;
    }
    for path in CURSOR_PATHS {
        if let Some(Value::String(s)) = get_by_path(data, path) {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    for path in CURSOR_PATHS {
        if let Some(Value::Number(n)) = get_by_path(data, path) {
            return Some(n.to_string());
        }
    }
    None
}

/// Relative next URLs are resolved against the profile URL.
pub fn absolutize(base_url: &str, next_url: &str) -> String {
    if looks_like_url(next_url) {
        return next_url.to_string();
    }
    match Url::parse(base_url).and_then(|b| b.join(next_url)) {
        Ok(joined) => joined.to_string(),
        Err(_) => next_url.to_string(),
    }
}
