//! Top-level error type and error-message hygiene helpers
//!
//! `Job.error` and dead-letter error text go through [`sanitize_error_message`]
//! and [`truncate_chars`]. JobError diagnostics keep the raw prompt and model
//! reply and are only truncated.

use crate::config::ConfigError;
use crate::messaging::{ConsumerError, PublishError};
use crate::transport::TransportError;
use crate::worker::BuildError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors surfaced by the worker process as a whole
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    #[error("Worker construction failed: {0}")]
    Build(#[from] BuildError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WorkerError {
    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for worker-level operations
pub type WorkerResult<T> = Result<T, WorkerError>;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|api[_-]?key|key|secret)[=:]\s*\S+")
        .expect("secret pattern is a valid regex")
});

static BEARER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)bearer\s+[a-z0-9._\-]+").expect("bearer pattern is a valid regex")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is a valid regex")
});

/// Redact credential-looking fragments from an error message
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let sanitized = BEARER_PATTERN.replace_all(&sanitized, "Bearer ***");
    SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .into_owned()
}

/// Cap `text` at `max_chars` Unicode scalar values, never splitting a code point
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
