//! Live backend sessions: proxy login, registry, liveness and revocation.

pub mod authenticator;
pub mod handle;
pub mod key;
pub mod probe;
pub mod registry;
pub mod revocation;
pub mod roles;

pub use authenticator::{ProxyAuthenticator, SessionGrant};
pub use handle::LiveHandle;
pub use key::SessionKey;
pub use probe::LivenessProber;
pub use registry::ConnectionRegistry;
pub use revocation::{RevocationBroadcaster, TeardownReport};
pub use roles::RolePolicy;
