//! Content-addressed response cache.
//!
//! Record mode persists responses as `<key>.meta.json` + `<key>.body` pairs;
//! replay mode serves requests from those artifacts and never touches the
//! network. The key hashes only what shapes the response: method, URL, params,
//! body, the Accept/Referer/Origin headers, and the resolved fetch mode.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::CACHE_STORE_STATUSES;
use crate::engine::HttpResponse;

/// Plan-level `http.cache` section.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: Option<PathBuf>,
    pub replay: bool,
    pub store_statuses: Option<Vec<u16>>,
}

#[derive(Serialize, Deserialize)]
struct CacheMeta {
    status: u16,
    final_url: String,
    headers: BTreeMap<String, String>,
    elapsed_ms: u64,
}

/// The request fields that participate in the cache key.
pub struct CacheKeyParts<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub params: &'a serde_json::Map<String, Value>,
    pub body: Option<&'a Value>,
    pub headers: &'a BTreeMap<String, String>,
    pub mode: &'a str,
}

/// Stable cache key: SHA-256 over canonical JSON of the request parts.
///
/// Headers are narrowed to Accept/Referer/Origin so incidental header noise
/// does not fragment the cache.
pub fn cache_key(parts: &CacheKeyParts<'_>) -> String {
    let header = |name: &str| parts.headers.get(name).cloned();
    let key_obj = json!({
        "m": parts.method.to_ascii_uppercase(),
        "u": parts.url,
        "p": Value::Object(parts.params.clone()),
        "j": parts.body.cloned().unwrap_or(Value::Null),
        "h": {
            "accept": header("accept"),
            "referer": header("referer"),
            "origin": header("origin"),
        },
        "mode": parts.mode,
    });
    // serde_json maps are BTree-backed, so serialization is already canonical
    let blob = serde_json::to_vec(&key_obj).unwrap_or_default();
    hex::encode(Sha256::digest(&blob))
}

/// Filesystem cache over a directory of `<key>.meta.json` / `<key>.body` pairs.
pub struct ResponseCache {
    dir: PathBuf,
    replay: bool,
    store_statuses: Vec<u16>,
}

impl ResponseCache {
    pub fn new(cfg: &CacheConfig) -> Option<Self> {
        let dir = cfg.dir.clone()?;
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("Failed to create cache dir {}: {e}", dir.display());
            return None;
        }
        Some(Self {
            dir,
            replay: cfg.replay,
            store_statuses: cfg
                .store_statuses
                .clone()
                .unwrap_or_else(|| CACHE_STORE_STATUSES.to_vec()),
        })
    }

    pub fn replay(&self) -> bool {
        self.replay
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{key}.meta.json")),
            self.dir.join(format!("{key}.body")),
        )
    }

    /// Loads a recorded response. `None` on any miss or damaged artifact.
    pub fn load(&self, key: &str) -> Option<HttpResponse> {
        let (meta_path, body_path) = self.paths(key);
        let meta_raw = fs::read_to_string(&meta_path).ok()?;
        let meta: CacheMeta = match serde_json::from_str(&meta_raw) {
            Ok(m) => m,
            Err(e) => {
                warn!("Damaged cache meta {}: {e}", meta_path.display());
                return None;
            }
        };
        let body = fs::read(&body_path).ok()?;
        debug!("cache hit: {key}");
        Some(HttpResponse {
            status: meta.status,
            final_url: meta.final_url,
            headers: meta.headers,
            body,
            elapsed_ms: meta.elapsed_ms,
        })
    }

    /// Persists a response if its status is on the allow-list. Cache write
    /// failures are logged, never fatal.
    pub fn save(&self, key: &str, resp: &HttpResponse) {
        if !self.store_statuses.contains(&resp.status) {
            return;
        }
        let (meta_path, body_path) = self.paths(key);
        let meta = CacheMeta {
            status: resp.status,
            final_url: resp.final_url.clone(),
            headers: resp.headers.clone(),
            elapsed_ms: resp.elapsed_ms,
        };
        let meta_json = match serde_json::to_string_pretty(&meta) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize cache meta for {key}: {e}");
                return;
            }
        };
        if let Err(e) = fs::write(&meta_path, meta_json) {
            warn!("Failed to write {}: {e}", meta_path.display());
            return;
        }
        if let Err(e) = fs::write(&body_path, &resp.body) {
            warn!("Failed to write {}: {e}", body_path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn parts_fixture<'a>(
        url: &'a str,
        params: &'a Map<String, Value>,
        headers: &'a BTreeMap<String, String>,
    ) -> CacheKeyParts<'a> {
        CacheKeyParts {
            method: "GET",
            url,
            params,
            body: None,
            headers,
            mode: "json",
        }
    }

    #[test]
    fn identical_requests_share_a_key() {
        let params: Map<String, Value> =
            serde_json::from_str(r#"{"page": 1, "q": "laptop"}"#).unwrap();
        let headers = BTreeMap::from([(
            "accept".to_string(),
            "application/json".to_string(),
        )]);
        let a = cache_key(&parts_fixture("https://api.example.com/items", &params, &headers));
        let b = cache_key(&parts_fixture("https://api.example.com/items", &params, &headers));
        assert_eq!(a, b);
    }

    #[test]
    fn params_and_url_change_the_key() {
        let p1: Map<String, Value> = serde_json::from_str(r#"{"page": 1}"#).unwrap();
        let p2: Map<String, Value> = serde_json::from_str(r#"{"page": 2}"#).unwrap();
        let headers = BTreeMap::new();
        let base = cache_key(&parts_fixture("https://api.example.com/items", &p1, &headers));
        assert_ne!(
            base,
            cache_key(&parts_fixture("https://api.example.com/items", &p2, &headers))
        );
        assert_ne!(
            base,
            cache_key(&parts_fixture("https://api.example.com/other", &p1, &headers))
        );
    }

    #[test]
    fn irrelevant_headers_do_not_fragment_the_cache() {
        let params = Map::new();
        let plain = BTreeMap::from([("accept".to_string(), "application/json".to_string())]);
        let noisy = BTreeMap::from([
            ("accept".to_string(), "application/json".to_string()),
            ("x-request-id".to_string(), "abc123".to_string()),
            ("cookie".to_string(), "session=1".to_string()),
        ]);
        assert_eq!(
            cache_key(&parts_fixture("https://api.example.com/items", &params, &plain)),
            cache_key(&parts_fixture("https://api.example.com/items", &params, &noisy))
        );
    }

    #[test]
    fn accept_header_does_change_the_key() {
        let params = Map::new();
        let json_accept = BTreeMap::from([("accept".to_string(), "application/json".to_string())]);
        let html_accept = BTreeMap::from([("accept".to_string(), "text/html".to_string())]);
        assert_ne!(
            cache_key(&parts_fixture("https://api.example.com/items", &params, &json_accept)),
            cache_key(&parts_fixture("https://api.example.com/items", &params, &html_accept))
        );
    }
}
