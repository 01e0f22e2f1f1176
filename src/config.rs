//! Service configuration.
//!
//! Loaded from a TOML file; every section and field has a default so an
//! empty file is valid input. Secrets can be supplied through the
//! environment instead of the file:
//!
//! - `SESSIONGATE_TOKEN_SECRET` overrides `[token] secret`
//! - `SESSIONGATE_PROXY_CREDENTIAL` overrides `[proxy] credential`

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const TOKEN_SECRET_ENV: &str = "SESSIONGATE_TOKEN_SECRET";
pub const PROXY_CREDENTIAL_ENV: &str = "SESSIONGATE_PROXY_CREDENTIAL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Service principal used to impersonate end-user identities.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_principal")]
    pub principal: String,
    #[serde(default)]
    pub credential: String,
    /// Application name written into the backend session tag.
    #[serde(default = "default_module")]
    pub module: String,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("principal", &self.principal)
            .field("credential", &"<redacted>")
            .field("module", &self.module)
            .finish()
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            principal: default_principal(),
            credential: String::new(),
            module: default_module(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Platform used when a caller does not name one.
    #[serde(default = "default_platform")]
    pub default_platform: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Role granted to customer-flavored sessions.
    #[serde(default = "default_customer_role")]
    pub customer_role: String,
    /// Recognized roles, highest priority first. The first one an identity
    /// holds becomes its primary role.
    #[serde(default = "default_role_priority")]
    pub role_priority: Vec<String>,
    /// Interval of the background dead-session sweep. 0 disables it.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_platform: default_platform(),
            probe_timeout_ms: default_probe_timeout_ms(),
            customer_role: default_customer_role(),
            role_priority: default_role_priority(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SessionConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffConfig {
    #[serde(default = "default_handoff_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_code_length")]
    pub code_length: usize,
    /// Upper bound on tracked handoffs; the oldest is evicted beyond it.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Platform a delegated handoff targets when the request names none.
    #[serde(default = "default_delegate_platform")]
    pub delegate_platform: String,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_handoff_ttl_secs(),
            code_length: default_code_length(),
            max_pending: default_max_pending(),
            delegate_platform: default_delegate_platform(),
        }
    }
}

impl HandoffConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default = "default_token_ttl_minutes")]
    pub ttl_minutes: i64,
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("ttl_minutes", &self.ttl_minutes)
            .finish()
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: default_issuer(),
            audience: default_audience(),
            ttl_minutes: default_token_ttl_minutes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind a non-loopback address. Off unless a proxy fronts the gateway.
    #[serde(default)]
    pub allow_public_bind: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allow_public_bind: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Simulated in-process backend seeded from `[[backend.identities]]`.
    #[default]
    Memory,
    /// PostgreSQL via `SET ROLE`; needs the `backend-postgres` feature.
    Postgres,
}

/// Identity the in-memory backend lets the proxy impersonate.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedIdentity {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Secret for `POST /api/session/login`. Without one the identity is
    /// only reachable through handoffs.
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for SeedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedIdentity")
            .field("name", &self.name)
            .field("roles", &self.roles)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Connection URL for network backends.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub identities: Vec<SeedIdentity>,
}

fn default_principal() -> String {
    "svc_sessiongate".into()
}
fn default_module() -> String {
    "sessiongate".into()
}
fn default_platform() -> String {
    "WEB".into()
}
const fn default_probe_timeout_ms() -> u64 {
    2_000
}
fn default_customer_role() -> String {
    "ROLE_CUSTOMER".into()
}
fn default_role_priority() -> Vec<String> {
    ["ROLE_ADMIN", "ROLE_RECEPTIONIST", "ROLE_TECHNICIAN", "ROLE_STOREKEEPER"]
        .into_iter()
        .map(String::from)
        .collect()
}
const fn default_sweep_interval_secs() -> u64 {
    60
}
const fn default_handoff_ttl_secs() -> u64 {
    120
}
const fn default_code_length() -> usize {
    8
}
const fn default_max_pending() -> usize {
    1024
}
fn default_delegate_platform() -> String {
    "MOBILE".into()
}
fn default_issuer() -> String {
    "sessiongate".into()
}
fn default_audience() -> String {
    "sessiongate-clients".into()
}
const fn default_token_ttl_minutes() -> i64 {
    12 * 60
}
fn default_host() -> String {
    "127.0.0.1".into()
}
const fn default_port() -> u16 {
    8088
}

impl Config {
    /// Read, parse, apply env overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(TOKEN_SECRET_ENV).filter(|s| !s.trim().is_empty()) {
            self.token.secret = secret;
        }
        if let Some(credential) = lookup(PROXY_CREDENTIAL_ENV).filter(|s| !s.trim().is_empty()) {
            self.proxy.credential = credential;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxy.principal.trim().is_empty() {
            bail!("[proxy] principal cannot be empty");
        }
        if self.proxy.module.trim().is_empty() {
            bail!("[proxy] module cannot be empty");
        }
        if self.session.default_platform.trim().is_empty() {
            bail!("[session] default_platform cannot be empty");
        }
        if self.session.probe_timeout_ms == 0 {
            bail!("[session] probe_timeout_ms must be greater than 0");
        }
        if self.session.customer_role.trim().is_empty() {
            bail!("[session] customer_role cannot be empty");
        }
        if self.handoff.code_length < 6 || self.handoff.code_length > 16 {
            bail!(
                "[handoff] code_length must be between 6 and 16 (got {})",
                self.handoff.code_length
            );
        }
        if self.handoff.max_pending == 0 {
            bail!("[handoff] max_pending must be greater than 0");
        }
        if self.token.secret.len() < 16 {
            bail!(
                "[token] secret must be at least 16 bytes (set it in the file or via {TOKEN_SECRET_ENV})"
            );
        }
        if self.token.ttl_minutes <= 0 {
            bail!("[token] ttl_minutes must be greater than 0");
        }
        if self.backend.kind == BackendKind::Postgres && self.backend.url.trim().is_empty() {
            bail!("[backend] url is required for the postgres backend");
        }
        Ok(())
    }
}
