//! Error types for the update pipeline.

use std::sync::Arc;

use thiserror::Error;

/// Errors that can terminate an update attempt.
///
/// Cancellation is carried here so that stage functions can propagate it
/// with `?`, but the updater never reports it as a failure: an attempt that
/// ends with `Cancelled` finishes in the `Cancelled` state with no error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// The resolver failed or did not expose a package location.
    #[error("Package resolution failed: {0}")]
    Resolution(String),

    /// The package could not be downloaded (I/O or network).
    #[error("Package download failed: {0}")]
    Download(String),

    /// The downloaded package did not match a reference digest.
    #[error("Package verification failed: {0}")]
    Verification(String),

    /// Backing up the application directory failed before installation.
    #[error("Application backup failed: {0}")]
    Backup(String),

    /// The installer failed, was disposed, or could not be configured.
    #[error("Package installation failed: {0}")]
    Installation(String),

    /// Cooperative cancellation was observed.
    #[error("Operation cancelled")]
    Cancelled,

    /// The object is in the wrong state for the requested operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl UpdateError {
    /// Whether this error only signals cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpdateError::Cancelled)
    }
}

/// Returns true if an operation body failed only because it was cancelled.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<UpdateError>()
        .map(UpdateError::is_cancelled)
        .unwrap_or(false)
}

/// Errors returned by [`start_and_wait`](crate::component::start_and_wait).
#[derive(Error, Debug, Clone)]
pub enum WaitError {
    /// `start()` returned false (wrong state or invalid parameters).
    #[error("Component refused to start")]
    StartRefused,

    /// The component reached `Failed`.
    #[error("Component failed: {0}")]
    Failed(Arc<anyhow::Error>),

    /// The caller's token fired before the component terminated.
    #[error("Wait abandoned before the component terminated")]
    Abandoned,
}

/// Result type alias for update operations.
pub type Result<T> = std::result::Result<T, UpdateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_detection() {
        let cancelled = anyhow::Error::new(UpdateError::Cancelled);
        assert!(is_cancellation(&cancelled));

        let wrapped = anyhow::Error::new(UpdateError::Cancelled).context("while extracting");
        assert!(is_cancellation(&wrapped));

        let failed = anyhow::Error::new(UpdateError::Download("connection reset".into()));
        assert!(!is_cancellation(&failed));

        let io = anyhow::anyhow!("disk full");
        assert!(!is_cancellation(&io));
    }

    #[test]
    fn test_error_messages() {
        let err = UpdateError::Verification("sha256 mismatch".into());
        assert_eq!(err.to_string(), "Package verification failed: sha256 mismatch");
        assert_eq!(UpdateError::Cancelled.to_string(), "Operation cancelled");
    }
}
