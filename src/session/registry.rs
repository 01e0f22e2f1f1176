//! Live session registry.
//!
//! Maps each [`SessionKey`] to the one [`LiveHandle`] currently serving it.
//!
//! ## Design
//! - The map lock is only held for map operations. Probes, backend kills
//!   and notifications run after it is released.
//! - Teardown is exactly-once because only the caller whose
//!   `HashMap::remove` returned the entry runs it.
//! - A lookup that finds a dead handle evicts it only if the entry is still
//!   the same `Arc`; a concurrent re-registration under the same key is
//!   left alone.
//! - Registration takes out every other session of the same
//!   (identity, platform) pair under the insert's lock, so racing logins
//!   leave exactly one of them registered.

use super::handle::LiveHandle;
use super::key::SessionKey;
use super::probe::LivenessProber;
use super::revocation::RevocationBroadcaster;
use crate::backend::{DriverError, ProbeOutcome};
use crate::error::{Result, SessionError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

enum Probed {
    Missing,
    Live(Arc<LiveHandle>),
    Dead(ProbeOutcome),
}

pub struct ConnectionRegistry {
    entries: Mutex<HashMap<SessionKey, Arc<LiveHandle>>>,
    prober: LivenessProber,
    broadcaster: RevocationBroadcaster,
}

impl ConnectionRegistry {
    pub fn new(prober: LivenessProber, broadcaster: RevocationBroadcaster) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            prober,
            broadcaster,
        }
    }

    pub fn broadcaster(&self) -> &RevocationBroadcaster {
        &self.broadcaster
    }

    /// Insert a handle as the only session of its (identity, platform)
    /// pair. Every handle it displaces is torn down once the lock is
    /// released.
    pub fn register(&self, handle: LiveHandle) -> Arc<LiveHandle> {
        let handle = Arc::new(handle);
        let displaced: Vec<Arc<LiveHandle>> = {
            let mut entries = self.entries.lock();
            let stale: Vec<SessionKey> = entries
                .keys()
                .filter(|k| k.belongs_to(handle.identity(), handle.platform()))
                .cloned()
                .collect();
            let displaced = stale.iter().filter_map(|k| entries.remove(k)).collect();
            entries.insert(handle.key().clone(), Arc::clone(&handle));
            displaced
        };

        tracing::info!(session = %handle.key(), "Session registered");
        for old in &displaced {
            tracing::warn!(
                session = %old.key(),
                replaced_by = %handle.session_id(),
                "Session displaced by a newer login"
            );
            self.broadcaster.teardown(old);
        }
        handle
    }

    /// Return the handle if it is registered and passes a liveness probe.
    /// A handle that fails the probe is torn down.
    pub fn lookup(&self, key: &SessionKey) -> Option<Arc<LiveHandle>> {
        match self.probe_entry(key) {
            Probed::Live(handle) => Some(handle),
            Probed::Missing | Probed::Dead(_) => None,
        }
    }

    /// Like [`lookup`](Self::lookup) but says why there is no handle.
    pub fn checkout(&self, key: &SessionKey) -> Result<Arc<LiveHandle>> {
        match self.probe_entry(key) {
            Probed::Live(handle) => Ok(handle),
            Probed::Missing => Err(SessionError::SessionNotFound),
            Probed::Dead(outcome) => Err(SessionError::SessionRevoked(format!(
                "backend session is {outcome}"
            ))),
        }
    }

    /// Registered, without probing.
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Take the entry out and tear it down. Returns `false` if another
    /// caller got there first or the key was never registered.
    pub fn remove(&self, key: &SessionKey) -> bool {
        let taken = self.entries.lock().remove(key);
        match taken {
            Some(handle) => {
                self.broadcaster.teardown(&handle);
                true
            }
            None => false,
        }
    }

    /// Remove every session of an (identity, platform) pair.
    pub fn remove_all_for(&self, identity: &str, platform: &str) -> usize {
        let keys: Vec<SessionKey> = self
            .entries
            .lock()
            .keys()
            .filter(|k| k.belongs_to(identity, platform))
            .cloned()
            .collect();

        keys.iter().filter(|key| self.remove(key)).count()
    }

    /// Hand back a backend error hit mid-operation. Errors that mean the
    /// backend session is gone revoke it.
    pub fn report_failure(&self, key: &SessionKey, err: &DriverError) -> SessionError {
        if err.invalidates_session() {
            tracing::warn!(session = %key, "Backend error invalidated session: {err}");
            self.remove(key);
            SessionError::SessionRevoked(err.to_string())
        } else {
            SessionError::BackendUnavailable(err.to_string())
        }
    }

    /// Probe every registered handle and evict the dead ones.
    pub fn sweep_dead(&self) -> usize {
        let snapshot: Vec<(SessionKey, Arc<LiveHandle>)> = self
            .entries
            .lock()
            .iter()
            .map(|(k, h)| (k.clone(), Arc::clone(h)))
            .collect();

        let evicted = snapshot
            .into_iter()
            .filter(|(key, handle)| {
                !self.prober.probe(handle).is_healthy() && self.remove_if_same(key, handle)
            })
            .count();
        if evicted > 0 {
            tracing::info!(evicted, "Dead sessions swept");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn keys_for_identity(&self, identity: &str) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self
            .entries
            .lock()
            .keys()
            .filter(|k| k.identity() == identity)
            .cloned()
            .collect();
        keys.sort_by(|a, b| {
            a.platform()
                .cmp(b.platform())
                .then_with(|| a.session_id().cmp(b.session_id()))
        });
        keys
    }

    fn probe_entry(&self, key: &SessionKey) -> Probed {
        let Some(handle) = self.entries.lock().get(key).cloned() else {
            return Probed::Missing;
        };

        let outcome = self.prober.probe(&handle);
        if outcome.is_healthy() {
            return Probed::Live(handle);
        }

        self.remove_if_same(key, &handle);
        Probed::Dead(outcome)
    }

    fn remove_if_same(&self, key: &SessionKey, handle: &Arc<LiveHandle>) -> bool {
        let taken = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(current) if Arc::ptr_eq(current, handle) => entries.remove(key),
                _ => None,
            }
        };
        match taken {
            Some(handle) => {
                self.broadcaster.teardown(&handle);
                true
            }
            None => false,
        }
    }
}
