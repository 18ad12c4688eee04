//! Error categorisation for the worker boundary.
//!
//! No automatic retry loop lives in this crate, so `ErrorCategory` exists
//! only to let callers distinguish a "the desired state already holds"
//! outcome (`NoRetry`) from a genuine failure (`Fatal`/`Retryable`).

use std::fmt;

/// Category of a failure observed while executing a work step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient failure (network, busy handle).
    Retryable,
    /// Permanent failure (permission denied, corrupt data, misconfiguration).
    Fatal,
    /// Not an error: the desired end state already holds (e.g. a 404 during
    /// delete cleanup, since the item was already absent).
    NoRetry,
}

/// An error observed while talking to a storage handler, the tracked-media
/// index, or the media-scanner HTTP service.
#[derive(Debug, Clone)]
pub struct SyncError {
    pub message: String,
    pub category: ErrorCategory,
}

impl SyncError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Retryable,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Fatal,
        }
    }

    pub fn no_retry(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::NoRetry,
        }
    }

    /// True for the "already in the desired state" case: a 404 hit while
    /// cleaning up a TMI after delete is success, not failure.
    pub fn is_already_satisfied(&self) -> bool {
        self.category == ErrorCategory::NoRetry
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SyncError {}

impl From<eyre::Report> for SyncError {
    fn from(err: eyre::Report) -> Self {
        SyncError::fatal(format!("{err:#}"))
    }
}

/// Categorise a status line returned by the media scanner: a leading
/// `404`/`500` is a failure, anything else unrecognised mid-poll is also
/// treated as a failure.
pub fn categorize_scanner_body(body: &str) -> ErrorCategory {
    let token = body.split_whitespace().next().unwrap_or("");
    match token {
        "404" | "500" => ErrorCategory::Fatal,
        _ => ErrorCategory::Retryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retry_is_already_satisfied() {
        let err = SyncError::no_retry("tmi already removed");
        assert!(err.is_already_satisfied());
    }

    #[test]
    fn fatal_is_not_already_satisfied() {
        let err = SyncError::fatal("permission denied");
        assert!(!err.is_already_satisfied());
    }

    #[test]
    fn scanner_body_categorisation() {
        assert_eq!(categorize_scanner_body("404 NOT FOUND"), ErrorCategory::Fatal);
        assert_eq!(categorize_scanner_body("500 internal error"), ErrorCategory::Fatal);
        assert_eq!(
            categorize_scanner_body("203 MEDIA INFO IN PROGRESS"),
            ErrorCategory::Retryable
        );
    }
}
