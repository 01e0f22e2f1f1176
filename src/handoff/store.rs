//! In-memory handoff store.
//!
//! ## Design
//! - Entries live in one map keyed by id, plus a code index. Both are
//!   updated under the same lock.
//! - Expiry is lazy: a pending entry past its deadline flips to expired the
//!   next time it is read. Confirmed entries never expire.
//! - Confirmation claims the entry (pending → claimed) under the lock,
//!   mints the session with the lock released, then finalizes
//!   (claimed → confirmed). Racing confirmations see a non-pending entry
//!   and fail. A failed mint puts the entry back to pending.
//!
//! ## Security
//! - Codes are drawn from a 32-symbol alphabet without 0/O/1/I
//! - Unknown, expired and spent codes fail identically
//! - The number of tracked entries is capped; the oldest is evicted

use super::strategy::{Confirmer, HandoffStrategy};
use crate::config::HandoffConfig;
use crate::error::{Result, SessionError};
use crate::session::key::normalize_platform;
use crate::session::{ProxyAuthenticator, SessionGrant};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Symbols a handoff code is drawn from.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const DEFAULT_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_CODE_LENGTH: usize = 8;
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Public status of a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Confirmed,
    Expired,
}

/// Session material stored on a confirmed handoff.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HandoffCredentials {
    pub identity: String,
    pub platform: String,
    pub session_id: String,
    pub token: String,
    pub roles: Vec<String>,
}

impl From<&SessionGrant> for HandoffCredentials {
    fn from(grant: &SessionGrant) -> Self {
        Self {
            identity: grant.identity.clone(),
            platform: grant.platform.clone(),
            session_id: grant.session_id.clone(),
            token: grant.token.clone(),
            roles: grant.roles.clone(),
        }
    }
}

/// Parameters of a new handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRequest {
    pub strategy: HandoffStrategy,
    pub source_identity: Option<String>,
    pub source_roles: Vec<String>,
    pub source_platform: String,
    /// Platform the resulting session is created on.
    pub target_platform: String,
}

impl HandoffRequest {
    /// Anonymous device pairing: whoever confirms signs the waiting device
    /// in as themselves.
    pub fn pairing(target_platform: &str) -> Self {
        Self {
            strategy: HandoffStrategy::SameIdentity,
            source_identity: None,
            source_roles: Vec::new(),
            source_platform: normalize_platform(target_platform),
            target_platform: normalize_platform(target_platform),
        }
    }

    /// Pairing bound to a known identity; only that identity can confirm.
    pub fn same_identity(identity: &str, roles: Vec<String>, platform: &str) -> Self {
        Self {
            strategy: HandoffStrategy::SameIdentity,
            source_identity: Some(identity.to_string()),
            source_roles: roles,
            source_platform: normalize_platform(platform),
            target_platform: normalize_platform(platform),
        }
    }

    /// Re-create the source session on another device (MOBILE by default).
    pub fn delegate(identity: &str, roles: Vec<String>, source_platform: &str) -> Self {
        Self {
            strategy: HandoffStrategy::DelegatedProxy,
            source_identity: Some(identity.to_string()),
            source_roles: roles,
            source_platform: normalize_platform(source_platform),
            target_platform: "MOBILE".into(),
        }
    }

    pub fn with_target_platform(mut self, platform: &str) -> Self {
        self.target_platform = normalize_platform(platform);
        self
    }
}

/// What `create` hands back to the initiating device.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HandoffTicket {
    pub id: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// Snapshot of one handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffSession {
    pub id: String,
    pub code: String,
    pub status: HandoffStatus,
    pub strategy: HandoffStrategy,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source_identity: Option<String>,
    pub source_roles: Vec<String>,
    pub source_platform: String,
    pub target_platform: String,
    pub credentials: Option<HandoffCredentials>,
}

/// Polling view. Credentials only appear for confirmed pairings, where the
/// polling device is the one receiving the session.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HandoffStatusView {
    pub id: String,
    pub status: HandoffStatus,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<HandoffCredentials>,
}

/// Result of a successful confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffGrant {
    pub handoff_id: String,
    pub strategy: HandoffStrategy,
    pub session: SessionGrant,
}

#[derive(Debug, Clone)]
enum EntryState {
    Pending,
    /// A confirmation is minting the session. Shown as pending.
    Claimed,
    Confirmed(HandoffCredentials),
    Expired,
}

#[derive(Debug, Clone)]
struct Entry {
    /// Creation order, for eviction.
    seq: u64,
    id: String,
    code: String,
    state: EntryState,
    strategy: HandoffStrategy,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    source_identity: Option<String>,
    source_roles: Vec<String>,
    source_platform: String,
    target_platform: String,
}

impl Entry {
    /// Lazy expiry. Only a plain pending entry can expire.
    fn touch(&mut self, now: DateTime<Utc>) {
        if matches!(self.state, EntryState::Pending) && now > self.expires_at {
            self.state = EntryState::Expired;
        }
    }

    fn status(&self) -> HandoffStatus {
        match self.state {
            EntryState::Pending | EntryState::Claimed => HandoffStatus::Pending,
            EntryState::Confirmed(_) => HandoffStatus::Confirmed,
            EntryState::Expired => HandoffStatus::Expired,
        }
    }

    fn credentials(&self) -> Option<&HandoffCredentials> {
        match &self.state {
            EntryState::Confirmed(creds) => Some(creds),
            _ => None,
        }
    }

    fn snapshot(&self) -> HandoffSession {
        HandoffSession {
            id: self.id.clone(),
            code: self.code.clone(),
            status: self.status(),
            strategy: self.strategy,
            created_at: self.created_at,
            expires_at: self.expires_at,
            source_identity: self.source_identity.clone(),
            source_roles: self.source_roles.clone(),
            source_platform: self.source_platform.clone(),
            target_platform: self.target_platform.clone(),
            credentials: self.credentials().cloned(),
        }
    }

    /// Whether a sweep may drop it.
    fn is_collectable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            EntryState::Claimed => false,
            EntryState::Expired => true,
            EntryState::Pending | EntryState::Confirmed(_) => now > self.expires_at,
        }
    }
}

#[derive(Debug, Default)]
struct Entries {
    by_id: HashMap<String, Entry>,
    /// Upper-cased code -> id.
    by_code: HashMap<String, String>,
    next_seq: u64,
}

impl Entries {
    fn remove(&mut self, id: &str) -> Option<Entry> {
        let entry = self.by_id.remove(id)?;
        self.by_code.remove(&entry.code);
        Some(entry)
    }

    fn id_for_code(&self, code: &str) -> Option<String> {
        self.by_code.get(&normalize_code(code)).cloned()
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let stale: Vec<String> = self
            .by_id
            .values()
            .filter(|e| e.is_collectable(now))
            .map(|e| e.id.clone())
            .collect();
        for id in &stale {
            self.remove(id);
        }
        stale.len()
    }

    fn evict_oldest(&mut self) -> Option<Entry> {
        let oldest = self
            .by_id
            .values()
            .filter(|e| !matches!(e.state, EntryState::Claimed))
            .min_by_key(|e| e.seq)
            .map(|e| e.id.clone())?;
        self.remove(&oldest)
    }
}

pub struct HandoffStore {
    entries: Mutex<Entries>,
    authenticator: Arc<ProxyAuthenticator>,
    ttl: chrono::Duration,
    code_length: usize,
    max_pending: usize,
}

impl HandoffStore {
    pub fn new(authenticator: Arc<ProxyAuthenticator>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            authenticator,
            ttl: to_chrono(DEFAULT_TTL),
            code_length: DEFAULT_CODE_LENGTH,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    pub fn from_config(authenticator: Arc<ProxyAuthenticator>, config: &HandoffConfig) -> Self {
        Self::new(authenticator)
            .with_ttl(config.ttl())
            .with_code_length(config.code_length)
            .with_max_pending(config.max_pending)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = to_chrono(ttl);
        self
    }

    pub fn with_code_length(mut self, length: usize) -> Self {
        self.code_length = length.max(1);
        self
    }

    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max.max(1);
        self
    }

    /// Open a new pending handoff.
    pub fn create(&self, request: HandoffRequest) -> HandoffTicket {
        let now = Utc::now();
        let mut entries = self.entries.lock();

        if entries.by_id.len() >= self.max_pending {
            entries.sweep(now);
            while entries.by_id.len() >= self.max_pending {
                match entries.evict_oldest() {
                    Some(evicted) => {
                        tracing::warn!(handoff_id = %evicted.id, "Handoff store full, evicted oldest")
                    }
                    None => break,
                }
            }
        }

        let code = loop {
            let candidate = generate_code(self.code_length);
            if !entries.by_code.contains_key(&candidate) {
                break candidate;
            }
        };
        let id = uuid::Uuid::new_v4().simple().to_string();
        let expires_at = now + self.ttl;

        entries.next_seq += 1;
        let entry = Entry {
            seq: entries.next_seq,
            id: id.clone(),
            code: code.clone(),
            state: EntryState::Pending,
            strategy: request.strategy,
            created_at: now,
            expires_at,
            source_identity: request.source_identity,
            source_roles: request.source_roles,
            source_platform: request.source_platform,
            target_platform: request.target_platform,
        };
        tracing::info!(
            handoff_id = %id,
            strategy = ?entry.strategy,
            target_platform = %entry.target_platform,
            "Handoff created"
        );
        entries.by_code.insert(code.clone(), id.clone());
        entries.by_id.insert(id.clone(), entry);

        HandoffTicket {
            id,
            code,
            expires_at,
        }
    }

    pub fn get_by_id(&self, id: &str) -> Option<HandoffSession> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let entry = entries.by_id.get_mut(id)?;
        entry.touch(now);
        Some(entry.snapshot())
    }

    /// Case-insensitive.
    pub fn get_by_code(&self, code: &str) -> Option<HandoffSession> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let id = entries.id_for_code(code)?;
        let entry = entries.by_id.get_mut(&id)?;
        entry.touch(now);
        Some(entry.snapshot())
    }

    /// Poll a handoff.
    pub fn status(&self, id: &str) -> Option<HandoffStatusView> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let entry = entries.by_id.get_mut(id)?;
        entry.touch(now);

        let credentials = match entry.strategy {
            HandoffStrategy::SameIdentity => entry.credentials().cloned(),
            HandoffStrategy::DelegatedProxy => None,
        };
        Some(HandoffStatusView {
            id: entry.id.clone(),
            status: entry.status(),
            expires_at: entry.expires_at,
            credentials,
        })
    }

    /// Confirm a pending code and mint the resulting session.
    ///
    /// Exactly one of any number of concurrent confirmations of the same
    /// code can succeed; the others get [`SessionError::HandoffCodeInvalid`].
    pub fn confirm(&self, code: &str, confirmer: &Confirmer) -> Result<HandoffGrant> {
        let now = Utc::now();

        let (id, strategy, resolution, target_platform) = {
            let mut entries = self.entries.lock();
            let id = entries
                .id_for_code(code)
                .ok_or(SessionError::HandoffCodeInvalid)?;
            let entry = entries
                .by_id
                .get_mut(&id)
                .ok_or(SessionError::HandoffCodeInvalid)?;
            entry.touch(now);
            if !matches!(entry.state, EntryState::Pending) {
                return Err(SessionError::HandoffCodeInvalid);
            }

            let resolution = entry.strategy.resolve(
                entry.source_identity.as_deref(),
                &entry.source_roles,
                confirmer,
                self.authenticator.policy(),
            )?;
            entry.state = EntryState::Claimed;
            (id, entry.strategy, resolution, entry.target_platform.clone())
        };

        let minted = self.authenticator.create_session(
            &resolution.identity,
            &target_platform,
            resolution.flavor,
            None,
        );

        let mut entries = self.entries.lock();
        let entry = entries.by_id.get_mut(&id);
        match minted {
            Ok(session) => {
                match entry {
                    Some(entry) => {
                        entry.state = EntryState::Confirmed(HandoffCredentials::from(&session))
                    }
                    None => tracing::warn!(handoff_id = %id, "Handoff vanished while confirming"),
                }
                tracing::info!(
                    handoff_id = %id,
                    identity = %session.identity,
                    platform = %session.platform,
                    "Handoff confirmed"
                );
                Ok(HandoffGrant {
                    handoff_id: id,
                    strategy,
                    session,
                })
            }
            Err(e) => {
                if let Some(entry) = entry {
                    entry.state = EntryState::Pending;
                }
                tracing::warn!(handoff_id = %id, "Handoff confirmation failed: {e}");
                Err(e)
            }
        }
    }

    /// Drop expired and stale confirmed entries. Memory hygiene only.
    pub fn sweep_expired(&self) -> usize {
        let removed = self.entries.lock().sweep(Utc::now());
        if removed > 0 {
            tracing::debug!(removed, "Handoff entries swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().by_id.is_empty()
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

fn generate_code(length: usize) -> String {
    use rand::RngExt;
    let mut rng = rand::rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(120))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendDriver, MemoryBackend, ProxyCredential};
    use crate::notify::Notifier;
    use crate::session::{ConnectionRegistry, LivenessProber, RevocationBroadcaster, SessionKey};
    use crate::token::HmacTokenIssuer;

    fn store_with(backend: &MemoryBackend) -> HandoffStore {
        let driver: Arc<dyn BackendDriver> = Arc::new(backend.clone());
        let registry = Arc::new(ConnectionRegistry::new(
            LivenessProber::default(),
            RevocationBroadcaster::new(driver.clone(), Arc::new(Notifier::new())),
        ));
        let issuer =
            Arc::new(HmacTokenIssuer::new("handoff-test-secret", "sessiongate", "clients", 60).unwrap());
        let auth = ProxyAuthenticator::new(
            driver,
            ProxyCredential {
                principal: "svc".into(),
                secret: "pw".into(),
            },
            registry,
            issuer,
        );
        HandoffStore::new(Arc::new(auth))
    }

    fn backend() -> MemoryBackend {
        MemoryBackend::new("svc", "pw")
            .with_identity("alice", &["ROLE_CUSTOMER"])
            .with_identity("tech", &["ROLE_TECHNICIAN"])
    }

    fn alice() -> Confirmer {
        Confirmer::authenticated("alice", vec!["ROLE_CUSTOMER".into()])
    }

    #[test]
    fn code_uses_restricted_alphabet() {
        for _ in 0..50 {
            let code = generate_code(8);
            assert_eq!(code.len(), 8);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
            assert!(!code.contains('0') && !code.contains('O') && !code.contains('1'));
        }
    }

    #[test]
    fn create_then_get_by_code_is_pending() {
        let store = store_with(&backend());
        let ticket = store.create(HandoffRequest::pairing("WEB"));

        let found = store.get_by_code(&ticket.code).unwrap();
        assert_eq!(found.id, ticket.id);
        assert_eq!(found.status, HandoffStatus::Pending);
        assert_eq!(store.get_by_id(&ticket.id).unwrap().code, ticket.code);
        let ttl = ticket.expires_at - found.created_at;
        assert_eq!(ttl.num_seconds(), 120);
    }

    #[test]
    fn lookup_by_code_ignores_case() {
        let store = store_with(&backend());
        let ticket = store.create(HandoffRequest::pairing("WEB"));
        let lower = ticket.code.to_lowercase();
        assert_eq!(store.get_by_code(&lower).unwrap().id, ticket.id);
        assert_eq!(store.get_by_code(&format!(" {lower} ")).unwrap().id, ticket.id);
    }

    #[test]
    fn expired_on_next_access() {
        let store = store_with(&backend()).with_ttl(Duration::ZERO);
        let ticket = store.create(HandoffRequest::pairing("WEB"));
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(store.get_by_id(&ticket.id).unwrap().status, HandoffStatus::Expired);
        assert_eq!(
            store.get_by_code(&ticket.code).unwrap().status,
            HandoffStatus::Expired
        );
        assert_eq!(
            store.confirm(&ticket.code, &alice()).unwrap_err(),
            SessionError::HandoffCodeInvalid
        );
    }

    #[test]
    fn confirm_pairing_mints_session_for_confirmer() {
        let backend = backend();
        let store = store_with(&backend);
        let ticket = store.create(HandoffRequest::pairing("WEB"));

        let grant = store.confirm(&ticket.code.to_lowercase(), &alice()).unwrap();
        assert_eq!(grant.handoff_id, ticket.id);
        assert_eq!(grant.session.identity, "alice");
        assert_eq!(grant.session.platform, "WEB");
        assert_eq!(grant.session.roles, vec!["ROLE_CUSTOMER"]);

        let view = store.status(&ticket.id).unwrap();
        assert_eq!(view.status, HandoffStatus::Confirmed);
        let creds = view.credentials.unwrap();
        assert_eq!(creds.session_id, grant.session.session_id);
        assert!(!creds.token.is_empty());
        assert!(store
            .authenticator
            .registry()
            .contains(&SessionKey::new("alice", "WEB", &creds.session_id)));
    }

    #[test]
    fn second_confirm_is_invalid() {
        let store = store_with(&backend());
        let ticket = store.create(HandoffRequest::pairing("WEB"));
        assert!(store.confirm(&ticket.code, &alice()).is_ok());
        assert_eq!(
            store.confirm(&ticket.code, &alice()).unwrap_err(),
            SessionError::HandoffCodeInvalid
        );
    }

    #[test]
    fn unknown_code_is_invalid() {
        let store = store_with(&backend());
        assert_eq!(
            store.confirm("ZZZZZZZZ", &alice()).unwrap_err(),
            SessionError::HandoffCodeInvalid
        );
    }

    #[test]
    fn confirmed_never_expires() {
        let store = store_with(&backend()).with_ttl(Duration::from_millis(30));
        let ticket = store.create(HandoffRequest::pairing("WEB"));
        store.confirm(&ticket.code, &alice()).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(
            store.get_by_id(&ticket.id).unwrap().status,
            HandoffStatus::Confirmed
        );
    }

    #[test]
    fn delegated_handoff_recreates_source_session_on_mobile() {
        let backend = backend();
        let store = store_with(&backend);
        let ticket = store.create(HandoffRequest::delegate(
            "tech",
            vec!["ROLE_TECHNICIAN".into()],
            "WEB",
        ));

        let grant = store.confirm(&ticket.code, &Confirmer::anonymous()).unwrap();
        assert_eq!(grant.strategy, HandoffStrategy::DelegatedProxy);
        assert_eq!(grant.session.identity, "tech");
        assert_eq!(grant.session.platform, "MOBILE");
        assert_eq!(grant.session.primary_role.as_deref(), Some("ROLE_TECHNICIAN"));

        // The polling source device only learns that it was confirmed.
        let view = store.status(&ticket.id).unwrap();
        assert_eq!(view.status, HandoffStatus::Confirmed);
        assert!(view.credentials.is_none());
    }

    #[test]
    fn failed_mint_releases_the_claim() {
        let backend = backend();
        let store = store_with(&backend);
        let ticket = store.create(HandoffRequest::pairing("WEB"));

        backend.set_reachable(false);
        assert!(matches!(
            store.confirm(&ticket.code, &alice()),
            Err(SessionError::BackendUnavailable(_))
        ));
        assert_eq!(
            store.get_by_id(&ticket.id).unwrap().status,
            HandoffStatus::Pending
        );

        backend.set_reachable(true);
        assert!(store.confirm(&ticket.code, &alice()).is_ok());
    }

    #[test]
    fn anonymous_pairing_confirm_looks_like_unknown_code() {
        let store = store_with(&backend());
        let ticket = store.create(HandoffRequest::pairing("WEB"));
        let live = store.confirm(&ticket.code, &Confirmer::anonymous()).unwrap_err();
        let unknown = store.confirm("ZZZZZZZZ", &Confirmer::anonymous()).unwrap_err();
        assert_eq!(live, SessionError::HandoffCodeInvalid);
        assert_eq!(live, unknown);
        assert_eq!(
            store.get_by_id(&ticket.id).unwrap().status,
            HandoffStatus::Pending
        );
    }

    #[test]
    fn cap_evicts_oldest() {
        let store = store_with(&backend()).with_max_pending(2);
        let first = store.create(HandoffRequest::pairing("WEB"));
        let second = store.create(HandoffRequest::pairing("WEB"));
        let third = store.create(HandoffRequest::pairing("WEB"));

        assert_eq!(store.len(), 2);
        assert!(store.get_by_id(&first.id).is_none());
        assert!(store.get_by_code(&first.code).is_none());
        assert!(store.get_by_id(&second.id).is_some());
        assert!(store.get_by_id(&third.id).is_some());
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let store = store_with(&backend()).with_ttl(Duration::ZERO);
        store.create(HandoffRequest::pairing("WEB"));
        store.create(HandoffRequest::pairing("MOBILE"));
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(store.sweep_expired(), 2);
        assert!(store.is_empty());
    }
}
