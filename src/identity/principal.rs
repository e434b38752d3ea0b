use serde::{Deserialize, Serialize};

/// An already-verified caller: identity string plus role claims.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self { user_id: user_id.into(), roles }
    }

    /// Case-insensitive identity comparison.
    pub fn is(&self, other: &str) -> bool {
        self.user_id.eq_ignore_ascii_case(other)
    }

    /// Case-insensitive role claim membership.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    pub fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        roles.iter().any(|r| self.has_role(r.as_ref()))
    }
}
