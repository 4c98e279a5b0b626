//! Application initialization and resource setup.
//!
//! This module provides functions to initialize shared resources:
//! - The logger (plain or JSON format)
//! - The HTTP client used by the request engine
//!
//! All initialization functions return proper error types for error handling.

mod client;
mod logger;

use log::SetLoggerError;
use reqwest::Error as ReqwestError;
use thiserror::Error;

// Re-export public API
pub use client::init_client;
pub use logger::init_logger_with;

/// Error types for initialization failures.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)] // All variants end with "Error" by convention
pub enum InitializationError {
    /// Error initializing the logger.
    #[error("Logger initialization error: {0}")]
    LoggerError(#[from] SetLoggerError),

    /// Error initializing the HTTP client.
    #[error("HTTP client initialization error: {0}")]
    HttpClientError(#[from] ReqwestError),
}
