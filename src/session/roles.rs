use crate::backend::SessionFlavor;
use crate::config::SessionConfig;

/// Primary-role selection and login flavor.
///
/// The priority list is a fixed, ordered set of recognized roles; the first
/// one an identity holds wins. Roles outside the list are carried in the
/// session but never become primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolePolicy {
    priority: Vec<String>,
    customer_role: String,
}

impl Default for RolePolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

impl RolePolicy {
    pub fn new(priority: Vec<String>, customer_role: &str) -> Self {
        Self {
            priority,
            customer_role: customer_role.to_string(),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.role_priority.clone(), &config.customer_role)
    }

    pub fn customer_role(&self) -> &str {
        &self.customer_role
    }

    /// First recognized role held, by priority. Matching ignores case but
    /// the returned value is spelled as in the priority list.
    pub fn primary_role(&self, roles: &[String]) -> Option<String> {
        self.priority
            .iter()
            .find(|candidate| roles.iter().any(|r| r.eq_ignore_ascii_case(candidate)))
            .cloned()
    }

    /// Customer if the role set contains the customer role.
    pub fn flavor_for(&self, roles: &[String]) -> SessionFlavor {
        if roles
            .iter()
            .any(|r| r.eq_ignore_ascii_case(&self.customer_role))
        {
            SessionFlavor::Customer
        } else {
            SessionFlavor::Employee
        }
    }
}
