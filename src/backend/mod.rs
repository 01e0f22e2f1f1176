//! Backend data-store driver boundary.
//!
//! The session core never talks to a database client directly. It goes
//! through [`BackendDriver`] (service-principal operations: proxy open and
//! targeted kill) and [`BackendConnection`] (operations on one opened,
//! identity-scoped connection).
//!
//! Drivers translate their native error codes into the closed
//! [`DriverError`] set here, so core logic never branches on raw backend
//! error numbers.

pub mod memory;
#[cfg(feature = "backend-postgres")]
pub mod postgres;

use std::fmt;
use std::time::Duration;

pub use memory::{MemoryBackend, MemoryBackendStats};

/// Closed set of driver failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// Connection not open, transport failure, name resolution failure.
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    /// Session killed by an operator, not logged on, bad credential.
    #[error("backend rejected the session: {0}")]
    Unauthorized(String),
    /// The operation did not answer within its deadline.
    #[error("backend operation timed out")]
    Timeout,
    /// Anything the adapter could not classify.
    #[error("unexpected backend response: {0}")]
    Unexpected(String),
}

impl DriverError {
    /// Whether this failure means the backend session itself is gone.
    pub fn invalidates_session(&self) -> bool {
        !matches!(ProbeOutcome::from(self), ProbeOutcome::Unknown)
    }
}

/// Result of a liveness probe against one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// Connection not open / transport failure / name resolution failure.
    Unreachable,
    /// Authentication or session invalidated.
    Unauthorized,
    /// The probe returned something unexpected.
    Unknown,
}

impl ProbeOutcome {
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unreachable => "unreachable",
            Self::Unauthorized => "unauthorized",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<&DriverError> for ProbeOutcome {
    fn from(err: &DriverError) -> Self {
        match err {
            DriverError::Unreachable(_) | DriverError::Timeout => Self::Unreachable,
            DriverError::Unauthorized(_) => Self::Unauthorized,
            DriverError::Unexpected(_) => Self::Unknown,
        }
    }
}

/// Service-principal credential used to open connections on behalf of an
/// identity (`principal[identity]`).
#[derive(Clone)]
pub struct ProxyCredential {
    pub principal: String,
    pub secret: String,
}

impl fmt::Debug for ProxyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredential")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Tag written onto an opened connection so out-of-band tooling can find
/// and kill it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTag {
    /// Application module name, e.g. `sessiongate-WEB`.
    pub module: String,
    pub session_id: String,
}

/// Which login flavor a session is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionFlavor {
    /// Roles resolved from the backend, primary role chosen by priority.
    Employee,
    /// Fixed customer role, context scoped to the customer identity.
    Customer,
}

/// Row-level security directive pushed after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    pub role: String,
    pub identity: String,
    pub flavor: SessionFlavor,
}

/// One opened, identity-scoped backend connection.
///
/// A connection is used by one request at a time; the registry wraps it in a
/// mutex, so implementations need `Send` but not `Sync`.
pub trait BackendConnection: Send {
    /// Cheap local check of the connection state.
    fn is_open(&self) -> bool;

    /// Trivial round trip bounded by `timeout`.
    fn ping(&mut self, timeout: Duration) -> Result<(), DriverError>;

    /// Write the module/session tag onto the backend session.
    fn tag_session(&mut self, tag: &SessionTag) -> Result<(), DriverError>;

    /// The backend's own identifier for this session, used for targeted kill.
    fn native_session_id(&mut self) -> Result<String, DriverError>;

    /// Authorization roles granted to `identity`.
    fn fetch_roles(&mut self, identity: &str) -> Result<Vec<String>, DriverError>;

    /// Scope subsequent operations to a role/identity.
    fn push_security_context(&mut self, ctx: &SecurityContext) -> Result<(), DriverError>;

    /// Release the connection. Called exactly once, during teardown.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// Service-principal operations against the backend.
pub trait BackendDriver: Send + Sync {
    /// Human-readable driver name for logs.
    fn name(&self) -> &str;

    /// Open a connection authenticating as `credential.principal[identity]`.
    fn open_as_proxy(
        &self,
        credential: &ProxyCredential,
        identity: &str,
    ) -> Result<Box<dyn BackendConnection>, DriverError>;

    /// Check an end user's own credential. Used by direct login, before the
    /// proxy connection is opened on the user's behalf.
    fn authenticate(&self, identity: &str, secret: &str) -> Result<(), DriverError>;

    /// Forcibly terminate the backend session with the given native id.
    fn kill_session(&self, native_session_id: &str) -> Result<(), DriverError>;
}
