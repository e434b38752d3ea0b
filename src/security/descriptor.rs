use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::identity::Principal;

/// Whether a descriptor grants read to every authenticated caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AccessLevel {
    #[default]
    Private,
    Public,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Private => "private",
            AccessLevel::Public => "public",
        }
    }

    /// `public` in any casing; everything else is private.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("public") { AccessLevel::Public } else { AccessLevel::Private }
    }
}

impl Serialize for AccessLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AccessLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|s| AccessLevel::parse(&s)).unwrap_or_default())
    }
}

/// The persisted authorization record for a container or a blob.
/// Container- and blob-level descriptors share this type; only their location differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccessDescriptor {
    pub owner: String,
    #[serde(default)]
    pub roles_allowed: Vec<String>,
    #[serde(default)]
    pub users_allowed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub access: AccessLevel,
}

impl AccessDescriptor {
    pub fn is_public(&self) -> bool {
        self.access == AccessLevel::Public
    }

    pub fn is_owner(&self, principal: &Principal) -> bool {
        principal.is(&self.owner)
    }

    pub fn lists_user(&self, principal: &Principal) -> bool {
        self.users_allowed.iter().any(|u| principal.is(u))
    }

    pub fn lists_any_role_of(&self, principal: &Principal) -> bool {
        principal.has_any_role(&self.roles_allowed)
    }

    /// Read rule. `public` short-circuits before any identity comparison.
    pub fn grants_read(&self, principal: &Principal) -> bool {
        self.is_public()
            || self.is_owner(principal)
            || self.lists_user(principal)
            || self.lists_any_role_of(principal)
    }

    /// Membership rule used for the container gate on writes: the explicit lists
    /// and the owner, but never the public flag.
    pub fn grants_membership(&self, principal: &Principal) -> bool {
        self.is_owner(principal) || self.lists_user(principal) || self.lists_any_role_of(principal)
    }

    /// Write rule: owner only. The lists and the access level never grant write.
    pub fn grants_write(&self, principal: &Principal) -> bool {
        self.is_owner(principal)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        // Tolerate a UTF-8 BOM written by other tooling.
        serde_json::from_str(raw.trim_start_matches('\u{feff}'))
    }
}
