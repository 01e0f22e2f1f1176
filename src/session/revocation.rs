use super::handle::LiveHandle;
use crate::backend::BackendDriver;
use crate::notify::{NotifyEvent, Notifier};
use std::sync::Arc;

/// What a teardown managed to do. Failures are logged, never returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub killed: bool,
    pub closed: bool,
    /// Subscribers the forced-logout event reached.
    pub notified: usize,
}

/// Exactly-once teardown of a session taken out of the registry.
///
/// Only the registry calls this, and only from the call that won the map
/// removal, so each step runs at most once per handle.
pub struct RevocationBroadcaster {
    driver: Arc<dyn BackendDriver>,
    notifier: Arc<Notifier>,
}

impl RevocationBroadcaster {
    pub fn new(driver: Arc<dyn BackendDriver>, notifier: Arc<Notifier>) -> Self {
        Self { driver, notifier }
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn driver(&self) -> &Arc<dyn BackendDriver> {
        &self.driver
    }

    pub fn teardown(&self, handle: &LiveHandle) -> TeardownReport {
        let mut report = TeardownReport::default();
        let session = handle.key().to_string();

        // Kill by native id: the local connection may already be broken.
        match self.driver.kill_session(handle.native_session_id()) {
            Ok(()) => report.killed = true,
            Err(e) => tracing::warn!(
                session = %session,
                native_session_id = handle.native_session_id(),
                driver = self.driver.name(),
                "Backend kill failed: {e}"
            ),
        }

        if let Some(mut conn) = handle.take_connection() {
            match conn.close() {
                Ok(()) => report.closed = true,
                Err(e) => tracing::warn!(session = %session, "Closing connection failed: {e}"),
            }
        }

        report.notified = self.notifier.publish(
            handle.session_id(),
            NotifyEvent::force_logout(handle.session_id()),
        );

        tracing::info!(
            session = %session,
            killed = report.killed,
            closed = report.closed,
            notified = report.notified,
            "Session revoked"
        );
        report
    }
}
