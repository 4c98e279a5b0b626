//! HTTP client initialization.
//!
//! This module provides the function that builds the `reqwest::Client` used by
//! the request engine.

use std::time::Duration;

use reqwest::ClientBuilder;

/// Initializes the HTTP client for the request engine.
///
/// Creates a `reqwest::Client` configured with:
/// - User-Agent header
/// - Per-request timeout
/// - Redirect following enabled (reqwest's default of up to 10 hops)
/// - A cookie store, because the fallback ladder's cookie-priming step feeds
///   harvested browser cookies back into the session
///
/// # Errors
///
/// Returns a `reqwest::Error` if client creation fails.
pub fn init_client(timeout: Duration, user_agent: &str) -> Result<reqwest::Client, reqwest::Error> {
    ClientBuilder::new()
        .timeout(timeout)
        .user_agent(user_agent.to_string())
        .cookie_store(true)
        .build()
}
