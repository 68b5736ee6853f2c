//! Resource limits for a batch run.
//!
//! Bounds every external interaction:
//! - Per-request timeout for source, backend and sink calls
//! - Whole-batch timeout
//! - Prompt and response sizes
//! - Number of concurrently processed transcripts

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied to a batch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Timeout for a single external call in seconds (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Total batch timeout in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// Maximum transcripts processed concurrently (default: 4)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Maximum prompt size in bytes (default: 200KB)
    #[serde(default = "default_max_prompt_bytes")]
    pub max_prompt_bytes: usize,

    /// Maximum accepted backend response size in bytes (default: 1MB)
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_request_timeout() -> u64 {
    60
}
fn default_run_timeout() -> u64 {
    3600
} // 1 hour
fn default_max_workers() -> usize {
    4
}
fn default_max_prompt_bytes() -> usize {
    200 * 1024
} // 200KB
fn default_max_response_bytes() -> usize {
    1024 * 1024
} // 1MB

impl Default for Limits {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
            run_timeout_seconds: default_run_timeout(),
            max_workers: default_max_workers(),
            max_prompt_bytes: default_max_prompt_bytes(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

impl Limits {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    /// Validate a backend response against the size limit
    pub fn validate_response(&self, response: &str) -> Result<(), LimitViolation> {
        let size = response.len();
        if size > self.max_response_bytes {
            return Err(LimitViolation::MaxResponseBytes {
                actual: size,
                limit: self.max_response_bytes,
            });
        }
        Ok(())
    }

    /// Check the limits themselves are usable
    pub fn validate(&self) -> Result<(), LimitViolation> {
        if self.max_workers == 0 {
            return Err(LimitViolation::ZeroWorkers);
        }
        if self.request_timeout_seconds == 0 {
            return Err(LimitViolation::ZeroTimeout);
        }
        Ok(())
    }
}

/// Truncate `text` to at most `max_bytes`, respecting char boundaries
pub fn truncate_to_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Limit violation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitViolation {
    #[error("Maximum response bytes exceeded: {actual} > {limit}")]
    MaxResponseBytes { actual: usize, limit: usize },

    #[error("max_workers must be at least 1")]
    ZeroWorkers,

    #[error("request_timeout_seconds must be at least 1")]
    ZeroTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = Limits::default();
        assert_eq!(limits.max_workers, 4);
        assert_eq!(limits.request_timeout(), Duration::from_secs(60));
        assert_eq!(limits.max_response_bytes, 1024 * 1024);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_response_validation() {
        let limits = Limits {
            max_response_bytes: 10,
            ..Default::default()
        };

        assert!(limits.validate_response("short").is_ok());
        let result = limits.validate_response(&"x".repeat(20));
        assert!(matches!(result, Err(LimitViolation::MaxResponseBytes { .. })));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let limits = Limits {
            max_workers: 0,
            ..Default::default()
        };
        assert_eq!(limits.validate(), Err(LimitViolation::ZeroWorkers));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_to_bytes("hello", 10), "hello");
        assert_eq!(truncate_to_bytes("hello", 3), "hel");
        // 'é' is two bytes; cutting inside it backs off
        assert_eq!(truncate_to_bytes("café", 4), "caf");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let limits: Limits = serde_yaml::from_str("max_workers: 2\n").unwrap();
        assert_eq!(limits.max_workers, 2);
        assert_eq!(limits.run_timeout_seconds, 3600);
    }
}
