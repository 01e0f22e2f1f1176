//! In-memory backend used by tests and by the demo server.
//!
//! Simulates a data store with proxy login, per-identity role grants,
//! session tagging, out-of-band kills and injectable faults. Every driver
//! call is counted so tests can assert exactly-once teardown.

use super::{
    BackendConnection, BackendDriver, DriverError, ProxyCredential, SecurityContext, SessionTag,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Snapshot of driver call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBackendStats {
    pub opens: usize,
    pub pings: usize,
    pub kills: usize,
    pub closes: usize,
}

#[derive(Debug, Default)]
struct BackendSession {
    identity: String,
    tag: Option<SessionTag>,
    context: Option<SecurityContext>,
    killed: bool,
    probe_fault: Option<DriverError>,
}

#[derive(Debug)]
struct Shared {
    principal: String,
    secret: String,
    /// identity -> granted roles
    grants: Mutex<HashMap<String, Vec<String>>>,
    /// identity -> login secret
    passwords: Mutex<HashMap<String, String>>,
    /// native session id -> session state, dropped when its connection closes
    sessions: Mutex<HashMap<String, BackendSession>>,
    reachable: Mutex<bool>,
    kill_fails: Mutex<bool>,
    open_latency: Mutex<Duration>,
    next_sid: AtomicU64,
    opens: AtomicUsize,
    pings: AtomicUsize,
    kills: AtomicUsize,
    closes: AtomicUsize,
}

/// Simulated backend. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    /// Create a backend that accepts the given service principal.
    pub fn new(principal: &str, secret: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                principal: principal.to_string(),
                secret: secret.to_string(),
                grants: Mutex::new(HashMap::new()),
                passwords: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                reachable: Mutex::new(true),
                kill_fails: Mutex::new(false),
                open_latency: Mutex::new(Duration::ZERO),
                next_sid: AtomicU64::new(100),
                opens: AtomicUsize::new(0),
                pings: AtomicUsize::new(0),
                kills: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }),
        }
    }

    /// Grant an identity the right to be impersonated, with its roles.
    pub fn with_identity(self, identity: &str, roles: &[&str]) -> Self {
        self.grant(identity, roles);
        self
    }

    pub fn grant(&self, identity: &str, roles: &[&str]) {
        self.shared.grants.lock().insert(
            identity.to_string(),
            roles.iter().map(|r| (*r).to_string()).collect(),
        );
    }

    /// Let `identity` log in directly with `secret`. Identities without a
    /// secret can only be reached through a proxy open.
    pub fn with_password(self, identity: &str, secret: &str) -> Self {
        self.set_password(identity, secret);
        self
    }

    pub fn set_password(&self, identity: &str, secret: &str) {
        self.shared
            .passwords
            .lock()
            .insert(identity.to_string(), secret.to_string());
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        *self.shared.reachable.lock() = reachable;
    }

    /// Make every `kill_session` call fail after being counted.
    pub fn set_kill_fails(&self, fails: bool) {
        *self.shared.kill_fails.lock() = fails;
    }

    /// Delay every proxy open, to widen race windows in tests.
    pub fn set_open_latency(&self, latency: Duration) {
        *self.shared.open_latency.lock() = latency;
    }

    /// Kill a session out of band, as an operator would.
    /// Returns `false` if no backend session carries that tag.
    pub fn kill_out_of_band(&self, session_id: &str) -> bool {
        let mut sessions = self.shared.sessions.lock();
        match find_by_tag(&mut sessions, session_id) {
            Some(session) => {
                session.killed = true;
                true
            }
            None => false,
        }
    }

    /// Make the next probes of a tagged session fail with `fault`.
    pub fn inject_probe_fault(&self, session_id: &str, fault: DriverError) -> bool {
        let mut sessions = self.shared.sessions.lock();
        match find_by_tag(&mut sessions, session_id) {
            Some(session) => {
                session.probe_fault = Some(fault);
                true
            }
            None => false,
        }
    }

    /// Security context currently pushed on the tagged session.
    pub fn context_for(&self, session_id: &str) -> Option<SecurityContext> {
        let mut sessions = self.shared.sessions.lock();
        find_by_tag(&mut sessions, session_id).and_then(|s| s.context.clone())
    }

    /// Module tag written on the session.
    pub fn module_for(&self, session_id: &str) -> Option<String> {
        let mut sessions = self.shared.sessions.lock();
        find_by_tag(&mut sessions, session_id)
            .and_then(|s| s.tag.as_ref().map(|t| t.module.clone()))
    }

    /// Identity the tagged session was opened for.
    pub fn identity_for(&self, session_id: &str) -> Option<String> {
        let mut sessions = self.shared.sessions.lock();
        find_by_tag(&mut sessions, session_id).map(|s| s.identity.clone())
    }

    /// Number of backend sessions not yet killed.
    pub fn live_sessions(&self) -> usize {
        self.shared
            .sessions
            .lock()
            .values()
            .filter(|s| !s.killed)
            .count()
    }

    /// Number of backend sessions still tracked, killed or not.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    pub fn stats(&self) -> MemoryBackendStats {
        MemoryBackendStats {
            opens: self.shared.opens.load(Ordering::SeqCst),
            pings: self.shared.pings.load(Ordering::SeqCst),
            kills: self.shared.kills.load(Ordering::SeqCst),
            closes: self.shared.closes.load(Ordering::SeqCst),
        }
    }

    fn is_reachable(&self) -> bool {
        *self.shared.reachable.lock()
    }
}

fn find_by_tag<'a>(
    sessions: &'a mut HashMap<String, BackendSession>,
    session_id: &str,
) -> Option<&'a mut BackendSession> {
    sessions
        .values_mut()
        .find(|s| s.tag.as_ref().is_some_and(|t| t.session_id == session_id))
}

impl BackendDriver for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn open_as_proxy(
        &self,
        credential: &ProxyCredential,
        identity: &str,
    ) -> Result<Box<dyn BackendConnection>, DriverError> {
        let latency = *self.shared.open_latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        if !self.is_reachable() {
            return Err(DriverError::Unreachable("could not resolve service name".into()));
        }
        if credential.principal != self.shared.principal || credential.secret != self.shared.secret
        {
            return Err(DriverError::Unauthorized("invalid username/password".into()));
        }
        if !self.shared.grants.lock().contains_key(identity) {
            return Err(DriverError::Unauthorized(format!(
                "proxy not authorized to connect as {identity}"
            )));
        }

        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let native_id = self.shared.next_sid.fetch_add(1, Ordering::SeqCst).to_string();
        self.shared.sessions.lock().insert(
            native_id.clone(),
            BackendSession {
                identity: identity.to_string(),
                ..BackendSession::default()
            },
        );

        Ok(Box::new(MemoryConnection {
            backend: self.clone(),
            native_id,
            open: true,
        }))
    }

    fn authenticate(&self, identity: &str, secret: &str) -> Result<(), DriverError> {
        if !self.is_reachable() {
            return Err(DriverError::Unreachable("could not resolve service name".into()));
        }
        let known = self.shared.grants.lock().contains_key(identity);
        let matches = self
            .shared
            .passwords
            .lock()
            .get(identity)
            .is_some_and(|expected| expected == secret);
        if known && matches {
            Ok(())
        } else {
            Err(DriverError::Unauthorized("invalid username/password".into()))
        }
    }

    fn kill_session(&self, native_session_id: &str) -> Result<(), DriverError> {
        self.shared.kills.fetch_add(1, Ordering::SeqCst);
        if *self.shared.kill_fails.lock() || !self.is_reachable() {
            return Err(DriverError::Unreachable("kill request failed".into()));
        }
        match self.shared.sessions.lock().get_mut(native_session_id) {
            Some(session) => {
                session.killed = true;
                Ok(())
            }
            None => Err(DriverError::Unexpected(format!(
                "no session with id {native_session_id}"
            ))),
        }
    }
}

/// One simulated connection.
struct MemoryConnection {
    backend: MemoryBackend,
    native_id: String,
    open: bool,
}

impl MemoryConnection {
    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut BackendSession) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        if !self.open {
            return Err(DriverError::Unreachable("connection is closed".into()));
        }
        if !self.backend.is_reachable() {
            return Err(DriverError::Unreachable("end-of-file on communication channel".into()));
        }
        let mut sessions = self.backend.shared.sessions.lock();
        let session = sessions
            .get_mut(&self.native_id)
            .ok_or_else(|| DriverError::Unauthorized("not logged on".into()))?;
        if session.killed {
            return Err(DriverError::Unauthorized("your session has been killed".into()));
        }
        f(session)
    }
}

impl BackendConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open
    }

    fn ping(&mut self, _timeout: Duration) -> Result<(), DriverError> {
        self.backend.shared.pings.fetch_add(1, Ordering::SeqCst);
        self.with_session(|session| match session.probe_fault.clone() {
            Some(fault) => Err(fault),
            None => Ok(()),
        })
    }

    fn tag_session(&mut self, tag: &SessionTag) -> Result<(), DriverError> {
        self.with_session(|session| {
            session.tag = Some(tag.clone());
            Ok(())
        })
    }

    fn native_session_id(&mut self) -> Result<String, DriverError> {
        let id = self.native_id.clone();
        self.with_session(|_| Ok(id))
    }

    fn fetch_roles(&mut self, identity: &str) -> Result<Vec<String>, DriverError> {
        self.with_session(|_| Ok(()))?;
        Ok(self
            .backend
            .shared
            .grants
            .lock()
            .get(identity)
            .cloned()
            .unwrap_or_default())
    }

    fn push_security_context(&mut self, ctx: &SecurityContext) -> Result<(), DriverError> {
        self.with_session(|session| {
            session.context = Some(ctx.clone());
            Ok(())
        })
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.backend.shared.closes.fetch_add(1, Ordering::SeqCst);
        if std::mem::replace(&mut self.open, false) {
            self.backend.shared.sessions.lock().remove(&self.native_id);
        }
        Ok(())
    }
}
