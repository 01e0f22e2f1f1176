use crate::error::{Result, SessionError};
use std::fmt;

/// `(identity, platform, session_id)`: the full triple every lookup uses.
///
/// Platforms are stored upper-cased so `web` and `WEB` name the same
/// partition. Identity and session id are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    identity: String,
    platform: String,
    session_id: String,
}

impl SessionKey {
    pub fn new(identity: &str, platform: &str, session_id: &str) -> Self {
        Self {
            identity: identity.trim().to_string(),
            platform: normalize_platform(platform),
            session_id: session_id.trim().to_string(),
        }
    }

    /// Build a key from caller-supplied parts, rejecting missing ones.
    pub fn from_parts(
        identity: Option<&str>,
        platform: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Self> {
        let identity = non_empty(identity).ok_or(SessionError::MissingSessionContext("identity"))?;
        let platform = non_empty(platform).ok_or(SessionError::MissingSessionContext("platform"))?;
        let session_id =
            non_empty(session_id).ok_or(SessionError::MissingSessionContext("session id"))?;
        Ok(Self::new(identity, platform, session_id))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether this key belongs to the given (identity, platform) pair.
    pub fn belongs_to(&self, identity: &str, platform: &str) -> bool {
        self.identity == identity.trim() && self.platform == normalize_platform(platform)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.identity, self.platform, self.session_id)
    }
}

pub fn normalize_platform(platform: &str) -> String {
    platform.trim().to_ascii_uppercase()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
