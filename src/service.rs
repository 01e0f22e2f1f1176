//! Wires the session core together from a [`Config`] and a backend driver.

use crate::backend::{BackendDriver, MemoryBackend, ProxyCredential};
use crate::config::{BackendKind, Config};
use crate::handoff::HandoffStore;
use crate::notify::Notifier;
use crate::session::{
    ConnectionRegistry, LivenessProber, ProxyAuthenticator, RevocationBroadcaster, RolePolicy,
};
use crate::token::HmacTokenIssuer;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Every shared component, each behind an `Arc`.
#[derive(Clone)]
pub struct SessionService {
    pub driver: Arc<dyn BackendDriver>,
    pub notifier: Arc<Notifier>,
    pub registry: Arc<ConnectionRegistry>,
    pub authenticator: Arc<ProxyAuthenticator>,
    pub handoff: Arc<HandoffStore>,
    pub tokens: Arc<HmacTokenIssuer>,
}

impl SessionService {
    pub fn new(config: &Config, driver: Arc<dyn BackendDriver>) -> Result<Self> {
        let tokens = Arc::new(
            HmacTokenIssuer::new(
                &config.token.secret,
                &config.token.issuer,
                &config.token.audience,
                config.token.ttl_minutes,
            )
            .context("Failed to build token issuer")?,
        );

        let notifier = Arc::new(Notifier::new());
        let registry = Arc::new(ConnectionRegistry::new(
            LivenessProber::new(config.session.probe_timeout()),
            RevocationBroadcaster::new(Arc::clone(&driver), Arc::clone(&notifier)),
        ));

        let authenticator = Arc::new(
            ProxyAuthenticator::new(
                Arc::clone(&driver),
                proxy_credential(config),
                Arc::clone(&registry),
                tokens.clone(),
            )
            .with_policy(RolePolicy::from_config(&config.session))
            .with_module(&config.proxy.module)
            .with_default_platform(&config.session.default_platform),
        );

        let handoff = Arc::new(HandoffStore::from_config(
            Arc::clone(&authenticator),
            &config.handoff,
        ));

        tracing::info!(
            driver = driver.name(),
            principal = %config.proxy.principal,
            "Session service ready"
        );

        Ok(Self {
            driver,
            notifier,
            registry,
            authenticator,
            handoff,
            tokens,
        })
    }

    /// Build with the driver named in `[backend]`.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config, build_driver(config)?)
    }
}

pub fn proxy_credential(config: &Config) -> ProxyCredential {
    ProxyCredential {
        principal: config.proxy.principal.clone(),
        secret: config.proxy.credential.clone(),
    }
}

pub fn build_driver(config: &Config) -> Result<Arc<dyn BackendDriver>> {
    match config.backend.kind {
        BackendKind::Memory => {
            let backend = MemoryBackend::new(&config.proxy.principal, &config.proxy.credential);
            for seed in &config.backend.identities {
                let roles: Vec<&str> = seed.roles.iter().map(String::as_str).collect();
                backend.grant(&seed.name, &roles);
                if let Some(password) = &seed.password {
                    backend.set_password(&seed.name, password);
                }
            }
            tracing::info!(
                identities = config.backend.identities.len(),
                "Using in-memory backend"
            );
            Ok(Arc::new(backend))
        }
        BackendKind::Postgres => postgres_driver(config),
    }
}

#[cfg(feature = "backend-postgres")]
fn postgres_driver(config: &Config) -> Result<Arc<dyn BackendDriver>> {
    let driver = crate::backend::postgres::PostgresDriver::new(
        &config.backend.url,
        config.session.probe_timeout().max(std::time::Duration::from_secs(5)),
        proxy_credential(config),
    )?;
    Ok(Arc::new(driver))
}

#[cfg(not(feature = "backend-postgres"))]
fn postgres_driver(_config: &Config) -> Result<Arc<dyn BackendDriver>> {
    anyhow::bail!("postgres backend requested but sessiongate was built without the `backend-postgres` feature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SessionFlavor;
    use crate::config::SeedIdentity;

    fn config() -> Config {
        let mut config = Config::default();
        config.token.secret = "service-test-secret-key".into();
        config.proxy.credential = "pw".into();
        config.backend.identities.push(SeedIdentity {
            name: "alice".into(),
            roles: vec!["ROLE_ADMIN".into()],
            password: Some("wonderland".into()),
        });
        config
    }

    #[test]
    fn from_config_seeds_memory_backend() {
        let service = SessionService::from_config(&config()).unwrap();
        assert_eq!(service.driver.name(), "memory");

        let grant = service
            .authenticator
            .create_session("alice", "", SessionFlavor::Employee, None)
            .unwrap();
        assert_eq!(grant.platform, "WEB");
        assert_eq!(grant.primary_role.as_deref(), Some("ROLE_ADMIN"));
        assert_eq!(service.tokens.verify(&grant.token).unwrap().sid, grant.session_id);
    }

    #[test]
    fn seeded_password_enables_direct_login() {
        let service = SessionService::from_config(&config()).unwrap();
        assert!(service.driver.authenticate("alice", "wonderland").is_ok());
        assert!(service.driver.authenticate("alice", "nope").is_err());
    }

    #[test]
    fn missing_secret_fails() {
        let mut config = config();
        config.token.secret.clear();
        assert!(SessionService::from_config(&config).is_err());
    }

    #[cfg(not(feature = "backend-postgres"))]
    #[test]
    fn postgres_without_feature_fails() {
        let mut config = config();
        config.backend.kind = BackendKind::Postgres;
        config.backend.url = "postgresql://localhost/app".into();
        let err = SessionService::from_config(&config).err().unwrap().to_string();
        assert!(err.contains("backend-postgres"));
    }
}
