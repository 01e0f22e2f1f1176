//! PostgreSQL driver.
//!
//! Proxy login maps onto PostgreSQL's role model: the service principal
//! connects with its own credential and then `SET ROLE`s to the target
//! identity, which it must be a member of. Sessions are tagged through
//! `application_name` plus the custom `app.session_id` setting, the native
//! session id is `pg_backend_pid()`, and kills go through
//! `pg_terminate_backend` on a separate admin connection.

use super::{
    BackendConnection, BackendDriver, DriverError, ProxyCredential, SecurityContext,
    SessionFlavor, SessionTag,
};
use parking_lot::Mutex;
use postgres::error::SqlState;
use postgres::{Client, NoTls};
use std::time::Duration;

/// Default role lookup: every role `$1` is a member of, except itself.
pub const DEFAULT_ROLE_QUERY: &str = "SELECT r.rolname::text FROM pg_roles r \
     WHERE pg_has_role($1, r.oid, 'MEMBER') AND r.rolname <> $1 ORDER BY r.rolname";

pub struct PostgresDriver {
    base: postgres::Config,
    role_query: String,
    admin: Mutex<Option<Client>>,
    admin_credential: ProxyCredential,
}

impl PostgresDriver {
    /// Build a driver from a connection URL (host, port, dbname).
    /// User and password always come from the proxy credential.
    pub fn new(
        url: &str,
        connect_timeout: Duration,
        admin_credential: ProxyCredential,
    ) -> anyhow::Result<Self> {
        let mut base: postgres::Config = url
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid backend url: {e}"))?;
        base.connect_timeout(connect_timeout);
        Ok(Self {
            base,
            role_query: DEFAULT_ROLE_QUERY.to_string(),
            admin: Mutex::new(None),
            admin_credential,
        })
    }

    /// Replace the role lookup query. It receives the identity as `$1` and
    /// must return one text column.
    pub fn with_role_query(mut self, query: &str) -> Self {
        self.role_query = query.to_string();
        self
    }

    fn connect(&self, credential: &ProxyCredential) -> Result<Client, DriverError> {
        let mut config = self.base.clone();
        config.user(&credential.principal);
        config.password(credential.secret.as_bytes());
        config.connect(NoTls).map_err(classify)
    }
}

impl BackendDriver for PostgresDriver {
    fn name(&self) -> &str {
        "postgres"
    }

    fn open_as_proxy(
        &self,
        credential: &ProxyCredential,
        identity: &str,
    ) -> Result<Box<dyn BackendConnection>, DriverError> {
        let mut client = self.connect(credential)?;
        client
            .batch_execute(&format!("SET ROLE {}", quote_ident(identity)))
            .map_err(classify)?;
        Ok(Box::new(PostgresConnection {
            client: Some(client),
            role_query: self.role_query.clone(),
        }))
    }

    fn authenticate(&self, identity: &str, secret: &str) -> Result<(), DriverError> {
        let client = self.connect(&ProxyCredential {
            principal: identity.to_string(),
            secret: secret.to_string(),
        })?;
        client.close().map_err(classify)
    }

    fn kill_session(&self, native_session_id: &str) -> Result<(), DriverError> {
        let pid: i32 = native_session_id
            .parse()
            .map_err(|_| DriverError::Unexpected(format!("invalid backend pid {native_session_id}")))?;

        let mut admin = self.admin.lock();
        if admin.as_ref().is_none_or(Client::is_closed) {
            *admin = Some(self.connect(&self.admin_credential)?);
        }
        let Some(client) = admin.as_mut() else {
            return Err(DriverError::Unreachable("admin connection unavailable".into()));
        };

        let row = client
            .query_one("SELECT pg_terminate_backend($1)", &[&pid])
            .map_err(classify)?;
        let terminated: bool = row.try_get(0).map_err(classify)?;
        if terminated {
            Ok(())
        } else {
            Err(DriverError::Unexpected(format!("backend {pid} was not terminated")))
        }
    }
}

struct PostgresConnection {
    /// `None` once closed.
    client: Option<Client>,
    role_query: String,
}

impl PostgresConnection {
    fn client(&mut self) -> Result<&mut Client, DriverError> {
        self.client
            .as_mut()
            .ok_or_else(|| DriverError::Unreachable("connection is closed".into()))
    }
}

impl BackendConnection for PostgresConnection {
    fn is_open(&self) -> bool {
        self.client.as_ref().is_some_and(|c| !c.is_closed())
    }

    fn ping(&mut self, timeout: Duration) -> Result<(), DriverError> {
        let millis = timeout.as_millis().max(1);
        let client = self.client()?;
        client
            .batch_execute(&format!("SET statement_timeout = {millis}"))
            .map_err(classify)?;
        let probe = client.query_one("SELECT 1", &[]);
        let reset = client.batch_execute("RESET statement_timeout");
        let row = probe.map_err(classify)?;
        reset.map_err(classify)?;

        match row.try_get::<_, i32>(0) {
            Ok(1) => Ok(()),
            Ok(other) => Err(DriverError::Unexpected(format!("probe returned {other}"))),
            Err(e) => Err(classify(e)),
        }
    }

    fn tag_session(&mut self, tag: &SessionTag) -> Result<(), DriverError> {
        self.client()?
            .query_one(
                "SELECT set_config('application_name', $1, false), \
                        set_config('app.session_id', $2, false)",
                &[&tag.module, &tag.session_id],
            )
            .map(|_| ())
            .map_err(classify)
    }

    fn native_session_id(&mut self) -> Result<String, DriverError> {
        let row = self
            .client()?
            .query_one("SELECT pg_backend_pid()", &[])
            .map_err(classify)?;
        let pid: i32 = row.try_get(0).map_err(classify)?;
        Ok(pid.to_string())
    }

    fn fetch_roles(&mut self, identity: &str) -> Result<Vec<String>, DriverError> {
        let query = self.role_query.clone();
        let rows = self
            .client()?
            .query(query.as_str(), &[&identity])
            .map_err(classify)?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(classify))
            .collect()
    }

    fn push_security_context(&mut self, ctx: &SecurityContext) -> Result<(), DriverError> {
        let flavor = match ctx.flavor {
            SessionFlavor::Employee => "employee",
            SessionFlavor::Customer => "customer",
        };
        self.client()?
            .query_one(
                "SELECT set_config('app.role', $1, false), \
                        set_config('app.identity', $2, false), \
                        set_config('app.flavor', $3, false)",
                &[&ctx.role, &ctx.identity, &flavor],
            )
            .map(|_| ())
            .map_err(classify)
    }

    fn close(&mut self) -> Result<(), DriverError> {
        match self.client.take() {
            Some(client) => client.close().map_err(classify),
            None => Ok(()),
        }
    }
}

/// Map a PostgreSQL error onto the closed driver error set.
fn classify(err: postgres::Error) -> DriverError {
    if err.is_closed() {
        return DriverError::Unreachable(err.to_string());
    }
    match err.code() {
        Some(code)
            if *code == SqlState::INVALID_PASSWORD
                || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
                || *code == SqlState::INSUFFICIENT_PRIVILEGE
                || *code == SqlState::UNDEFINED_OBJECT
                || *code == SqlState::ADMIN_SHUTDOWN =>
        {
            DriverError::Unauthorized(err.to_string())
        }
        Some(code) if *code == SqlState::QUERY_CANCELED => DriverError::Timeout,
        Some(code)
            if *code == SqlState::CONNECTION_EXCEPTION
                || *code == SqlState::CONNECTION_FAILURE
                || *code == SqlState::CONNECTION_DOES_NOT_EXIST
                || *code == SqlState::CANNOT_CONNECT_NOW =>
        {
            DriverError::Unreachable(err.to_string())
        }
        Some(_) => DriverError::Unexpected(err.to_string()),
        // No SQLSTATE: the failure happened below the protocol (io, tls, dns).
        None => DriverError::Unreachable(err.to_string()),
    }
}

/// Quote an identifier for interpolation into `SET ROLE`.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
