use super::key::SessionKey;
use crate::backend::{BackendConnection, DriverError, SessionFlavor};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// One live backend session.
///
/// Owns the connection plus the backend's native session id, which is
/// captured at open time so the session can still be killed after the
/// connection object itself has broken.
pub struct LiveHandle {
    key: SessionKey,
    native_session_id: String,
    roles: Vec<String>,
    primary_role: Option<String>,
    flavor: SessionFlavor,
    created_at: DateTime<Utc>,
    /// `None` once disposed.
    conn: Mutex<Option<Box<dyn BackendConnection>>>,
}

impl std::fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveHandle")
            .field("key", &self.key)
            .field("native_session_id", &self.native_session_id)
            .field("primary_role", &self.primary_role)
            .field("flavor", &self.flavor)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl LiveHandle {
    pub fn new(
        key: SessionKey,
        conn: Box<dyn BackendConnection>,
        native_session_id: String,
        roles: Vec<String>,
        primary_role: Option<String>,
        flavor: SessionFlavor,
    ) -> Self {
        Self {
            key,
            native_session_id,
            roles,
            primary_role,
            flavor,
            created_at: Utc::now(),
            conn: Mutex::new(Some(conn)),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn identity(&self) -> &str {
        self.key.identity()
    }

    pub fn platform(&self) -> &str {
        self.key.platform()
    }

    pub fn session_id(&self) -> &str {
        self.key.session_id()
    }

    pub fn native_session_id(&self) -> &str {
        &self.native_session_id
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn primary_role(&self) -> Option<&str> {
        self.primary_role.as_deref()
    }

    pub fn flavor(&self) -> SessionFlavor {
        self.flavor
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Run an operation on the connection. Callers are expected to use a
    /// handle from one request at a time; the lock only guards disposal.
    pub fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut dyn BackendConnection) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut guard = self.conn.lock();
        match guard.as_deref_mut() {
            Some(conn) => op(conn),
            None => Err(DriverError::Unreachable("session handle was disposed".into())),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.conn.lock().is_none()
    }

    /// Detach the connection for disposal. Returns `None` the second time.
    pub(crate) fn take_connection(&self) -> Option<Box<dyn BackendConnection>> {
        self.conn.lock().take()
    }
}
