//! Session error taxonomy.

use veil_subscription::FetchError;

/// Errors surfaced by coordinator commands or folded into `last_error`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("tunnel start failed: {0}")]
    TunnelStartFailed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Which command family an error belongs to.
///
/// `last_error` is cleared by the next success of the same category, so a
/// subscription failure is not wiped out by an unrelated successful
/// connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorCategory {
    Connection,
    Subscription,
}

impl From<FetchError> for SessionError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::InvalidInput(msg) => SessionError::InvalidInput(msg),
            FetchError::Network(msg) => SessionError::Network(msg),
            FetchError::Parse(msg) => SessionError::Parse(msg),
            FetchError::Timeout(after) => SessionError::Network(format!("timed out after {after:?}")),
        }
    }
}
