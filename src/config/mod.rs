//! Application configuration and constants.
//!
//! This module provides:
//! - Configuration constants (defaults, status sets, bounds)
//! - The library configuration struct
//! - Logging option types

mod constants;
mod types;

// Re-export all constants
pub use constants::*;
pub use types::{HarvestConfig, LogFormat, LogLevel};
