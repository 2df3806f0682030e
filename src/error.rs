//! Error type shared by queries and mutations.

use thiserror::Error;

/// Error type for query and mutation operations.
///
/// Errors are captured into the owning query or mutation record and fanned
/// out to subscribers; the cache itself never raises them across its public
/// boundary. Connectivity loss is not an error: a fetch that cannot proceed
/// while offline is paused, not failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The fetch or mutation operation itself failed.
    ///
    /// This is the only variant that is retried according to the configured
    /// retry policy.
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// The operation was cancelled before it produced a result.
    ///
    /// Cancellation is never retried and does not count against the retry
    /// budget.
    #[error("Fetch cancelled")]
    Cancelled,
}

impl QueryError {
    /// Returns `true` if this error is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = QueryError::FetchFailed("boom".to_string());
        assert_eq!(err.to_string(), "Fetch failed: boom");

        let err = QueryError::Cancelled;
        assert_eq!(err.to_string(), "Fetch cancelled");
    }

    #[test]
    fn test_is_cancelled() {
        assert!(QueryError::Cancelled.is_cancelled());
        assert!(!QueryError::FetchFailed("x".to_string()).is_cancelled());
    }
}
