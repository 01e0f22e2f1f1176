use crate::backend::SessionFlavor;
use crate::error::{Result, SessionError};
use crate::session::RolePolicy;

/// Who may confirm a handoff and whose session it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStrategy {
    /// Device pairing: an already signed-in device confirms the code and
    /// the waiting device receives a session for the confirming identity.
    SameIdentity,
    /// Delegated propagation: the source session is re-created for the
    /// source identity on the confirming device.
    DelegatedProxy,
}

/// The actor entering the code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Confirmer {
    pub identity: Option<String>,
    pub roles: Vec<String>,
}

impl Confirmer {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(identity: &str, roles: Vec<String>) -> Self {
        Self {
            identity: Some(identity.to_string()),
            roles,
        }
    }
}

/// Identity and flavor the resulting session is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resolution {
    pub identity: String,
    pub flavor: SessionFlavor,
}

impl HandoffStrategy {
    pub(crate) fn resolve(
        self,
        source_identity: Option<&str>,
        source_roles: &[String],
        confirmer: &Confirmer,
        policy: &RolePolicy,
    ) -> Result<Resolution> {
        match self {
            Self::SameIdentity => {
                // An anonymous confirmer must not learn that the code is live,
                // so it gets the same answer as an unknown code. A handoff
                // bound to a source identity only pairs devices of that
                // identity.
                let identity = confirmer
                    .identity
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or(SessionError::HandoffCodeInvalid)?;
                if source_identity.is_some_and(|source| source != identity) {
                    return Err(SessionError::HandoffCodeInvalid);
                }
                Ok(Resolution {
                    identity: identity.to_string(),
                    flavor: policy.flavor_for(&confirmer.roles),
                })
            }
            Self::DelegatedProxy => {
                let identity = source_identity.ok_or(SessionError::HandoffCodeInvalid)?;
                Ok(Resolution {
                    identity: identity.to_string(),
                    flavor: policy.flavor_for(source_roles),
                })
            }
        }
    }
}
