//! Shared utility functions.

use chrono::{DateTime, Utc};
use std::fmt::Display;

// =============================================================================
// Text Normalization
// =============================================================================

/// Lowercase, trim and collapse internal whitespace runs to a single space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Date Buckets
// =============================================================================

/// `YYYY-MM-DD` bucket for per-day aggregates
#[inline]
pub fn day_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// `YYYY-MM` bucket for per-month aggregates
#[inline]
pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

// =============================================================================
// Error Logging Helpers
// =============================================================================

/// Log an error at warn level and convert it to `None`.
pub fn log_filter_warn<T, E: Display>(result: Result<T, E>, context: &str) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("{}: {}", context, e);
            None
        }
    }
}
