use std::time::Duration;
use thiserror::Error;

/// Stable error categories surfaced to callers. One user-visible error per
/// operation; the CLI maps these to exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadPassword,
    Corrupt,
    SourceMismatch,
    Network,
    Timeout,
    RateLimited,
    Auth,
    RemoteRejected,
    Canceled,
    IntegrityFailure,
    NotFound,
    Internal,
}

/// Domain error for the chatvault core.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("password rejected")]
    BadPassword,

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("resume source does not match recorded content: {0}")]
    SourceMismatch(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out")]
    Timeout,

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("credential rejected: {0}")]
    Auth(String),

    #[error("remote rejected request: {0}")]
    RemoteRejected(String),

    #[error("operation canceled")]
    Canceled,

    #[error("integrity check failed: {0}")]
    IntegrityFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadPassword => ErrorKind::BadPassword,
            Self::Corrupt(_) => ErrorKind::Corrupt,
            Self::SourceMismatch(_) => ErrorKind::SourceMismatch,
            Self::Network(_) | Self::Io(_) => ErrorKind::Network,
            Self::Timeout => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Auth(_) => ErrorKind::Auth,
            Self::RemoteRejected(_) => ErrorKind::RemoteRejected,
            Self::Canceled => ErrorKind::Canceled,
            Self::IntegrityFailure(_) => ErrorKind::IntegrityFailure,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transient errors a worker may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimited
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_kind() {
        assert!(VaultError::Network("reset".into()).is_retryable());
        assert!(VaultError::Timeout.is_retryable());
        assert!(
            VaultError::RateLimited {
                retry_after: Duration::from_secs(3)
            }
            .is_retryable()
        );
        assert!(!VaultError::Auth("revoked".into()).is_retryable());
        assert!(!VaultError::RemoteRejected("too big".into()).is_retryable());
        assert!(!VaultError::BadPassword.is_retryable());
    }
}
