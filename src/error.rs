//! Error types for mirrorsync

use thiserror::Error;

/// Result type alias for mirrorsync operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Main error type for mirrorsync
///
/// Only [`MirrorError::Fatal`] aborts a reconciliation run; every other kind
/// is reported per key through the result stream and the run continues.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Listing error at `{key}`: {message}")]
    Listing { key: String, message: String },

    #[error("Overwrite not allowed for `{0}`")]
    OverwriteNotAllowed(String),

    #[error("Invalid target `{0}`: source and target types differ")]
    InvalidTarget(String),

    #[error("Transfer failed for `{key}`: {message}")]
    Transfer { key: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Throttled by backend: {0}")]
    Throttled(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MirrorError {
    /// Whether this error aborts the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, MirrorError::Fatal(_))
    }

    /// Whether a retry of the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MirrorError::Unavailable(_) | MirrorError::Throttled(_) | MirrorError::Transfer { .. }
        )
    }

    /// Whether this is a policy refusal rather than a backend failure
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            MirrorError::OverwriteNotAllowed(_) | MirrorError::InvalidTarget(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(MirrorError::Fatal("no endpoint".into()).is_fatal());
        assert!(!MirrorError::OverwriteNotAllowed("a/b".into()).is_fatal());
        assert!(!MirrorError::Cancelled.is_fatal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(MirrorError::Throttled("slow down".into()).is_retryable());
        assert!(MirrorError::Transfer {
            key: "a".into(),
            message: "reset".into()
        }
        .is_retryable());
        assert!(!MirrorError::InvalidTarget("a".into()).is_retryable());
    }
}
