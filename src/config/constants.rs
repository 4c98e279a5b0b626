//! Configuration constants.
//!
//! Defaults and bounds used throughout the pipeline: retry timings, cache
//! status allow-lists, block-classifier scan limits.

// Defaults
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DB_PATH: &str = "./page_harvest.db";

/// Default User-Agent string for HTTP requests.
///
/// Plans normally carry their own `headers.User-Agent`; this is the value used
/// when a plan leaves it unset.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Default Accept header for HTML-mode requests.
pub const DEFAULT_HTML_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
/// Default Accept header for JSON-mode requests.
pub const DEFAULT_JSON_ACCEPT: &str = "application/json, text/plain, */*";

// Retry strategy
/// Maximum number of attempts per fetch (including the initial attempt).
pub const RETRY_MAX_ATTEMPTS: u32 = 4;
/// Base delay for exponential backoff.
pub const RETRY_BASE_DELAY_SECS: f64 = 0.5;
/// Backoff delay cap.
pub const RETRY_CAP_DELAY_SECS: f64 = 8.0;
/// HTTP statuses worth retrying.
pub const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
/// A Retry-After courtesy wait is bounded to `cap_delay * RETRY_AFTER_CAP_FACTOR`
/// so an adversarial server cannot park the run indefinitely.
pub const RETRY_AFTER_CAP_FACTOR: u32 = 4;

// Fallback ladder
/// Statuses that trigger the fallback ladder when no override is configured.
pub const FALLBACK_ON_STATUS: [u16; 1] = [403];

// Response cache
/// Statuses whose responses are persisted in record mode.
pub const CACHE_STORE_STATUSES: [u16; 9] = [200, 201, 202, 203, 204, 206, 301, 302, 304];

// Block classifier bounds
/// How many body characters the classifier inspects for challenge markers.
pub const BLOCK_SCAN_CHARS: usize = 6_000;
/// Length of the body snippet persisted with a blocked event.
pub const BLOCK_SNIPPET_CHARS: usize = 1_200;
/// Response headers kept on a blocked event; everything else is noise.
pub const BLOCK_KEEP_HEADERS: [&str; 6] = [
    "server",
    "cf-ray",
    "set-cookie",
    "location",
    "content-type",
    "retry-after",
];

// Payload reading
/// Bounded preview length for payload diagnostics in logs and errors.
pub const PAYLOAD_PREVIEW_CHARS: usize = 220;

// Pagination
/// Safety limit on batches per run when the plan does not set one.
pub const DEFAULT_MAX_BATCHES: u32 = 200;
