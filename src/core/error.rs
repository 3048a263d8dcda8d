//! Error type system for the source runtime
//!
//! This module provides the error taxonomy shared by every stage of the
//! plugin pipeline:
//! - Narrow, stage-naming error kinds (fetch, integrity, validation, activation)
//! - Structured fetch failures carrying URL, status and attempt count
//! - Retry classification
//!
//! `SourceError` is `Clone` so that coalesced installs can hand the very same
//! failure to every waiting caller.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::config::ConfigError;
use crate::plugin::types::Capability;

/// Main error type for the source runtime
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    // Descriptor errors (raised before any network call)
    #[error("Invalid plugin descriptor: {0}")]
    InvalidDescriptor(String),

    // Pipeline stage errors
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Artifact at {url} is an HTML page, not plugin source")]
    HtmlInsteadOfCode { url: String },

    #[error("Integrity mismatch for {id}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Validation failed: {}", .reasons.join("; "))]
    Validation { reasons: Vec<String> },

    #[error("Activation of {id} failed: {message}")]
    Activation { id: String, message: String },

    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    // Plugin call errors
    #[error("Plugin {id} does not support {capability}")]
    Unsupported { id: String, capability: Capability },

    #[error("Plugin execution error: {0}")]
    PluginExecution(String),

    // Collaborator errors
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SourceError {
    /// Get the error type name, stable across message changes
    pub fn error_type(&self) -> &'static str {
        match self {
            SourceError::InvalidDescriptor(_) => "InvalidDescriptor",
            SourceError::Fetch(_) => "FetchFailure",
            SourceError::HtmlInsteadOfCode { .. } => "HtmlInsteadOfCode",
            SourceError::IntegrityMismatch { .. } => "IntegrityMismatch",
            SourceError::Validation { .. } => "ValidationFailure",
            SourceError::Activation { .. } => "ActivationFailure",
            SourceError::NotFound(_) => "NotFound",
            SourceError::Unsupported { .. } => "Unsupported",
            SourceError::PluginExecution(_) => "PluginExecutionError",
            SourceError::Catalog(_) => "CatalogError",
            SourceError::Config(_) => "ConfigError",
            SourceError::Io(_) => "IoError",
            SourceError::Internal(_) => "InternalError",
        }
    }

    /// Check if this error is retryable
    ///
    /// Only transient fetch failures qualify. Integrity and validation
    /// verdicts are about bytes already in hand and never change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Fetch(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Build an activation error for the given plugin
    pub fn activation(id: impl Into<String>, message: impl fmt::Display) -> Self {
        SourceError::Activation {
            id: id.into(),
            message: message.to_string(),
        }
    }
}

impl From<ConfigError> for SourceError {
    fn from(err: ConfigError) -> Self {
        SourceError::Config(err.to_string())
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::Io(err.to_string())
    }
}

/// Classification of a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// The URL was not an absolute HTTP(S) URL
    InvalidUrl,
    /// The request did not complete within the timeout
    Timeout,
    /// The connection failed or the body could not be read
    Network,
    /// The server answered with a non-success status
    HttpStatus,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::InvalidUrl => write!(f, "invalid url"),
            FetchErrorKind::Timeout => write!(f, "timeout"),
            FetchErrorKind::Network => write!(f, "network error"),
            FetchErrorKind::HttpStatus => write!(f, "http status"),
        }
    }
}

/// A fetch that gave up
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Fetch of {url} failed ({kind}) after {attempts} attempt(s){}: {message}", .status.map(|s| format!(", last status {}", s)).unwrap_or_default())]
pub struct FetchError {
    pub url: String,
    pub kind: FetchErrorKind,
    /// Last HTTP status seen, if any response arrived
    pub status: Option<u16>,
    pub attempts: u32,
    pub message: String,
}

impl FetchError {
    pub fn new(url: impl Into<String>, kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind,
            status: None,
            attempts: 0,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Timeouts, transport failures and 5xx responses are worth another try
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            FetchErrorKind::Timeout | FetchErrorKind::Network => true,
            FetchErrorKind::HttpStatus => matches!(self.status, Some(s) if s >= 500),
            FetchErrorKind::InvalidUrl => false,
        }
    }
}

/// Result type alias for operations that can fail with SourceError
pub type Result<T> = std::result::Result<T, SourceError>;

/// Context extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error, producing an internal error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let context_str = context.into();
            SourceError::Internal(format!("{}: {}", context_str, e))
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let context_str = f();
            SourceError::Internal(format!("{}: {}", context_str, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types() {
        assert_eq!(
            SourceError::NotFound("test".into()).error_type(),
            "NotFound"
        );
        assert_eq!(
            SourceError::Validation { reasons: vec![] }.error_type(),
            "ValidationFailure"
        );
        assert_eq!(
            SourceError::HtmlInsteadOfCode { url: "x".into() }.error_type(),
            "HtmlInsteadOfCode"
        );
    }

    #[test]
    fn test_fetch_error_retryable() {
        let timeout = FetchError::new("https://a.test", FetchErrorKind::Timeout, "slow");
        assert!(timeout.is_retryable());

        let server = FetchError::new("https://a.test", FetchErrorKind::HttpStatus, "boom")
            .with_status(503);
        assert!(server.is_retryable());

        let client = FetchError::new("https://a.test", FetchErrorKind::HttpStatus, "gone")
            .with_status(404);
        assert!(!client.is_retryable());

        let invalid = FetchError::new("ftp://a.test", FetchErrorKind::InvalidUrl, "scheme");
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn test_only_fetch_errors_are_retryable() {
        let fetch: SourceError = FetchError::new("https://a.test", FetchErrorKind::Network, "reset").into();
        assert!(fetch.is_retryable());
        assert!(!SourceError::IntegrityMismatch {
            id: "a".into(),
            expected: "00".into(),
            actual: "11".into(),
        }
        .is_retryable());
        assert!(!SourceError::Validation { reasons: vec!["eval".into()] }.is_retryable());
    }

    #[test]
    fn test_fetch_error_display_carries_details() {
        let err = FetchError::new("https://cdn.test/a.js", FetchErrorKind::HttpStatus, "Service Unavailable")
            .with_status(503)
            .with_attempts(4);
        let msg = err.to_string();
        assert!(msg.contains("https://cdn.test/a.js"));
        assert!(msg.contains("503"));
        assert!(msg.contains("4 attempt"));
    }

    #[test]
    fn test_validation_display_lists_all_reasons() {
        let err = SourceError::Validation {
            reasons: vec!["first".into(), "second".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"));

        let contexted = result.context("Failed to create scratch directory");

        let err = contexted.unwrap_err();
        assert!(err.to_string().contains("Failed to create scratch directory"));
        assert!(err.to_string().contains("file not found"));
    }
}
