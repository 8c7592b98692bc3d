//! Crate-wide error type.
//!
//! Every fallible engine path returns [`Error`]. Variants map onto the
//! failure classes the engine distinguishes at runtime: permission refusals
//! from extractors, validation failures on tool arguments, plan state
//! machine violations, confirmation hash mismatches, cooperative
//! cancellation, and dependency outages. Infrastructure errors (SQLite,
//! I/O, JSON, HTTP) convert via `#[from]`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An extractor refused access to its source.
    #[error("permission denied by source '{0}'")]
    PermissionDenied(String),

    /// Tool arguments or migration invariants failed validation.
    #[error("validation failed for '{field}': {reason}")]
    ValidationFailed { field: String, reason: String },

    /// Plan, document, or job lookup miss.
    #[error("{0} not found")]
    NotFound(String),

    /// A state machine transition was attempted from the wrong state.
    #[error("state conflict: expected {expected}, actual {actual}")]
    StateConflict { expected: String, actual: String },

    /// The confirmation hash did not match the plan's operation hash.
    #[error("operation hash mismatch: expected {expected}, provided {provided}")]
    HashMismatch { expected: String, provided: String },

    /// A plan outlived its confirmation TTL.
    #[error("{0} has expired")]
    Expired(String),

    /// The embedder, planner, or vector backend is unreachable.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Foreign-key or schema integrity violation.
    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    /// Cooperative cancellation was observed at a suspension point.
    #[error("operation cancelled")]
    Cancelled,

    /// A wall-clock budget was exceeded.
    #[error("operation timed out: {0}")]
    TimedOut(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Unclassified internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable kind tag used in CLI output and audit details.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::PermissionDenied(_) => "permission_denied",
            Error::ValidationFailed { .. } => "validation_failed",
            Error::NotFound(_) => "not_found",
            Error::StateConflict { .. } => "state_conflict",
            Error::HashMismatch { .. } => "hash_mismatch",
            Error::Expired(_) => "expired",
            Error::DependencyUnavailable(_) => "dependency_unavailable",
            Error::StorageCorruption(_) => "storage_corruption",
            Error::Cancelled => "cancelled",
            Error::TimedOut(_) => "timed_out",
            Error::Database(_) => "database",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Http(_) => "http",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether a background job failing with this error should be retried.
    ///
    /// Transient infrastructure failures retry; logical failures (validation,
    /// state conflicts, cancellation) never do.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::DependencyUnavailable(_)
                | Error::TimedOut(_)
                | Error::Database(_)
                | Error::Io(_)
                | Error::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(
            Error::HashMismatch {
                expected: "a".into(),
                provided: "b".into()
            }
            .kind(),
            "hash_mismatch"
        );
        assert_eq!(
            Error::PermissionDenied("mail".into()).kind(),
            "permission_denied"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(Error::DependencyUnavailable("embedder".into()).is_transient());
        assert!(Error::TimedOut("search".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::ValidationFailed {
            field: "title".into(),
            reason: "required".into()
        }
        .is_transient());
    }
}
