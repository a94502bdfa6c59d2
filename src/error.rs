//! Error types for the Cinder refresh orchestrator.
//!
//! Every failure a refresh run can hit is represented here so the retry
//! loop can tell the kinds apart: lock-timeout failures have their own
//! retry budget, a handful of kinds are terminal and never retried, and
//! everything else is retried under the general budget.

use thiserror::Error;

/// The primary error type for Cinder operations.
#[derive(Error, Debug)]
pub enum CinderError {
    /// A catalog lock could not be acquired within its timeout
    #[error("Lock timeout: {message}")]
    LockTimeout { message: String },

    /// Base table partitions kept changing across snapshot verification attempts
    #[error("Unstable partition layout: {message}")]
    UnstablePartitionLayout { message: String },

    /// Scope/diff computation could not resolve partition expressions
    #[error("Analysis error: {message}")]
    Analysis { message: String },

    /// The rebuild plan failed (semantic error, data error, resource exhaustion)
    #[error("Execution error: {message}")]
    Execution { message: String },

    /// The materialized view or a base table was removed mid-run
    #[error("Concurrent drop: {message}")]
    ConcurrentDrop { message: String },

    /// The materialized view is marked inactive
    #[error("Materialized view inactive: {reason}")]
    InactiveMv { reason: String },

    /// The run was cancelled via its kill flag
    #[error("Refresh cancelled")]
    Cancelled,

    /// Catalog error (database not found, table not found, etc.)
    #[error("Catalog error: {message}")]
    Catalog { message: String },

    /// Invalid argument
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Internal error (bug in the orchestrator)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CinderError {
    /// Create a lock timeout error.
    pub fn lock_timeout(message: impl Into<String>) -> Self {
        Self::LockTimeout {
            message: message.into(),
        }
    }

    /// Create an unstable partition layout error.
    pub fn unstable_partition_layout(message: impl Into<String>) -> Self {
        Self::UnstablePartitionLayout {
            message: message.into(),
        }
    }

    /// Create an analysis error.
    pub fn analysis(message: impl Into<String>) -> Self {
        Self::Analysis {
            message: message.into(),
        }
    }

    /// Create an execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Create a concurrent drop error.
    pub fn concurrent_drop(message: impl Into<String>) -> Self {
        Self::ConcurrentDrop {
            message: message.into(),
        }
    }

    /// Create an inactive materialized view error.
    pub fn inactive_mv(reason: impl Into<String>) -> Self {
        Self::InactiveMv {
            reason: reason.into(),
        }
    }

    /// Create a catalog error.
    pub fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog {
            message: message.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this is a lock-timeout failure, which consumes its own
    /// retry budget instead of the general one.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Whether the refresh retry loop may re-attempt after this error.
    ///
    /// Terminal kinds (concurrent drop, inactive view, analysis failures,
    /// cancellation) are surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::UnstablePartitionLayout { .. } | Self::Execution { .. }
        )
    }
}

/// Result type alias for Cinder operations.
pub type Result<T> = std::result::Result<T, CinderError>;

/// Truncate an error message to `max_len` bytes for persistence.
///
/// Truncation respects char boundaries so the result is still valid UTF-8.
pub(crate) fn truncate_message(message: &str, max_len: usize) -> String {
    if message.len() <= max_len {
        return message.to_string();
    }
    let mut end = max_len;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CinderError::lock_timeout("Failed to lock database: db1");
        assert_eq!(err.to_string(), "Lock timeout: Failed to lock database: db1");
        assert!(err.is_lock_timeout());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_terminal_kinds_not_retryable() {
        assert!(!CinderError::concurrent_drop("mv dropped").is_retryable());
        assert!(!CinderError::inactive_mv("base table gone").is_retryable());
        assert!(!CinderError::analysis("bad partition expr").is_retryable());
        assert!(!CinderError::Cancelled.is_retryable());
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("short", 100), "short");
        assert_eq!(truncate_message("abcdef", 3), "abc");
        // multi-byte chars are not split
        let s = "日本語";
        assert_eq!(truncate_message(s, 4), "日");
    }
}
