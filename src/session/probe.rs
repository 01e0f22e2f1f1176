use super::handle::LiveHandle;
use crate::backend::{DriverError, ProbeOutcome};
use std::time::Duration;

/// Default bound on a liveness round trip.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Checks a cached handle before it is handed out.
#[derive(Debug, Clone, Copy)]
pub struct LivenessProber {
    timeout: Duration,
}

impl Default for LivenessProber {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl LivenessProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn probe(&self, handle: &LiveHandle) -> ProbeOutcome {
        let result = handle.with_connection(|conn| {
            if !conn.is_open() {
                return Err(DriverError::Unreachable("connection is not open".into()));
            }
            conn.ping(self.timeout)
        });

        match result {
            Ok(()) => ProbeOutcome::Healthy,
            Err(err) => {
                let outcome = ProbeOutcome::from(&err);
                tracing::debug!(
                    session = %handle.key(),
                    outcome = outcome.label(),
                    "Liveness probe failed: {err}"
                );
                outcome
            }
        }
    }
}
