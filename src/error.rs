//! Error taxonomy surfaced to callers of the session core.
//!
//! Every failure a controller can observe collapses into one of the
//! [`SessionError`] kinds. Driver-specific detail is kept in the message for
//! logs but callers branch on the variant only.

use crate::backend::DriverError;

/// Failures returned by the session core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The caller omitted identity, platform or session id.
    #[error("missing session context: {0}")]
    MissingSessionContext(&'static str),

    /// The session was never registered or has been evicted.
    #[error("session not found")]
    SessionNotFound,

    /// The backend reports the session as killed, logged off or otherwise
    /// invalidated. The caller must re-authenticate.
    #[error("session revoked: {0}")]
    SessionRevoked(String),

    /// The proxy login was rejected by the backend.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Unknown, expired or already-confirmed handoff code. Deliberately
    /// carries no detail.
    #[error("handoff code is invalid or has expired")]
    HandoffCodeInvalid,

    /// Generic connectivity failure talking to the backend.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl SessionError {
    /// Whether the caller has to go through a fresh login.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound | Self::SessionRevoked(_) | Self::AuthenticationFailed(_)
        )
    }

    /// Map a failure raised while opening a proxy connection.
    pub(crate) fn from_open_failure(err: DriverError) -> Self {
        match err {
            DriverError::Unauthorized(msg) => Self::AuthenticationFailed(msg),
            DriverError::Unreachable(msg) | DriverError::Unexpected(msg) => {
                Self::BackendUnavailable(msg)
            }
            DriverError::Timeout => Self::BackendUnavailable("timed out".into()),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;
