//! Proxy login.
//!
//! Opens a backend connection as the service principal impersonating the
//! end-user identity, prepares it, and registers it as that identity's only
//! session on the platform.
//!
//! ## Setup order
//! 1. Evict every existing session of the (identity, platform) pair
//! 2. Open `principal[identity]`, pick the session id
//! 3. Tag the backend session, read its native id
//! 4. Resolve roles, pick the primary role, push the security context
//! 5. Register the handle, displacing any session of the pair that logged
//!    in while this one was being prepared
//! 6. Mint the token
//!
//! Each step depends on the previous one. A failure in 3 or 4 closes the
//! fresh connection before the error is returned.

use super::handle::LiveHandle;
use super::key::{normalize_platform, SessionKey};
use super::registry::ConnectionRegistry;
use super::roles::RolePolicy;
use crate::backend::{
    BackendConnection, BackendDriver, DriverError, ProxyCredential, SecurityContext,
    SessionFlavor, SessionTag,
};
use crate::error::{Result, SessionError};
use crate::token::TokenIssuer;
use std::sync::Arc;

/// Material returned to the caller of a successful login.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SessionGrant {
    pub identity: String,
    pub platform: String,
    pub session_id: String,
    /// Full resolved role set, not just the primary role.
    pub roles: Vec<String>,
    pub primary_role: Option<String>,
    pub token: String,
}

pub struct ProxyAuthenticator {
    driver: Arc<dyn BackendDriver>,
    credential: ProxyCredential,
    registry: Arc<ConnectionRegistry>,
    issuer: Arc<dyn TokenIssuer>,
    policy: RolePolicy,
    module: String,
    default_platform: String,
}

impl ProxyAuthenticator {
    pub fn new(
        driver: Arc<dyn BackendDriver>,
        credential: ProxyCredential,
        registry: Arc<ConnectionRegistry>,
        issuer: Arc<dyn TokenIssuer>,
    ) -> Self {
        Self {
            driver,
            credential,
            registry,
            issuer,
            policy: RolePolicy::default(),
            module: "sessiongate".into(),
            default_platform: "WEB".into(),
        }
    }

    pub fn with_policy(mut self, policy: RolePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Application name used in the backend session tag (`<module>-<platform>`).
    pub fn with_module(mut self, module: &str) -> Self {
        self.module = module.to_string();
        self
    }

    pub fn with_default_platform(mut self, platform: &str) -> Self {
        self.default_platform = normalize_platform(platform);
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &RolePolicy {
        &self.policy
    }

    pub fn default_platform(&self) -> &str {
        &self.default_platform
    }

    pub fn flavor_for(&self, roles: &[String]) -> SessionFlavor {
        self.policy.flavor_for(roles)
    }

    /// Direct login: check the end user's own secret with the backend, then
    /// create the proxy session.
    pub fn login(
        &self,
        identity: &str,
        secret: &str,
        platform: &str,
        flavor: SessionFlavor,
    ) -> Result<SessionGrant> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(SessionError::MissingSessionContext("identity"));
        }
        self.driver.authenticate(identity, secret).map_err(|e| {
            tracing::warn!(identity, driver = self.driver.name(), "Login rejected: {e}");
            SessionError::from_open_failure(e)
        })?;
        self.create_session(identity, platform, flavor, None)
    }

    /// Log `identity` in on `platform`, replacing any session it already
    /// has there. An empty platform falls back to the default platform.
    pub fn create_session(
        &self,
        identity: &str,
        platform: &str,
        flavor: SessionFlavor,
        requested_session_id: Option<&str>,
    ) -> Result<SessionGrant> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(SessionError::MissingSessionContext("identity"));
        }
        let platform = if platform.trim().is_empty() {
            self.default_platform.clone()
        } else {
            normalize_platform(platform)
        };

        let evicted = self.registry.remove_all_for(identity, &platform);
        if evicted > 0 {
            tracing::info!(identity, platform = %platform, evicted, "Evicted previous sessions");
        }

        let mut conn = self
            .driver
            .open_as_proxy(&self.credential, identity)
            .map_err(|e| {
                tracing::warn!(
                    identity,
                    platform = %platform,
                    driver = self.driver.name(),
                    "Proxy login failed: {e}"
                );
                SessionError::from_open_failure(e)
            })?;
        let session_id = requested_session_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from);

        let prepared = self.prepare(conn.as_mut(), identity, &platform, &session_id, flavor);
        let (native_session_id, roles, primary_role) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(close_err) = conn.close() {
                    tracing::warn!(identity, "Closing half-open connection failed: {close_err}");
                }
                tracing::warn!(identity, platform = %platform, "Session setup failed: {e}");
                return Err(match e {
                    DriverError::Unauthorized(msg) => SessionError::AuthenticationFailed(msg),
                    other => SessionError::BackendUnavailable(other.to_string()),
                });
            }
        };

        let key = SessionKey::new(identity, &platform, &session_id);
        self.registry.register(LiveHandle::new(
            key.clone(),
            conn,
            native_session_id,
            roles.clone(),
            primary_role.clone(),
            flavor,
        ));

        let token = match self.issuer.mint(identity, &roles, &session_id) {
            Ok(token) => token,
            Err(e) => {
                self.registry.remove(&key);
                return Err(SessionError::AuthenticationFailed(format!(
                    "token issuance failed: {e}"
                )));
            }
        };

        tracing::info!(
            identity,
            platform = %platform,
            session_id = %session_id,
            primary_role = primary_role.as_deref().unwrap_or("-"),
            ?flavor,
            "Session created"
        );

        Ok(SessionGrant {
            identity: identity.to_string(),
            platform,
            session_id,
            roles,
            primary_role,
            token,
        })
    }

    /// Steps 3 and 4 on a freshly opened connection.
    fn prepare(
        &self,
        conn: &mut dyn BackendConnection,
        identity: &str,
        platform: &str,
        session_id: &str,
        flavor: SessionFlavor,
    ) -> std::result::Result<(String, Vec<String>, Option<String>), DriverError> {
        conn.tag_session(&SessionTag {
            module: format!("{}-{platform}", self.module),
            session_id: session_id.to_string(),
        })?;
        let native_session_id = conn.native_session_id()?;

        let (roles, primary_role) = match flavor {
            SessionFlavor::Employee => {
                let roles = conn.fetch_roles(identity)?;
                let primary = self.policy.primary_role(&roles);
                (roles, primary)
            }
            SessionFlavor::Customer => {
                let role = self.policy.customer_role().to_string();
                (vec![role.clone()], Some(role))
            }
        };

        if let Some(role) = &primary_role {
            conn.push_security_context(&SecurityContext {
                role: role.clone(),
                identity: identity.to_string(),
                flavor,
            })?;
        }

        Ok((native_session_id, roles, primary_role))
    }
}
