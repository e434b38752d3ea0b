use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::descriptor::AccessDescriptor;
use super::store::{DescriptorKey, DescriptorLookup, DescriptorStore};
use crate::identity::{is_admin, Principal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Container(&'a str),
    Blob { container: &'a str, path: &'a str },
}

impl<'a> Target<'a> {
    pub fn container_name(&self) -> &'a str {
        match self {
            Target::Container(c) => c,
            Target::Blob { container, .. } => container,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

/// Where the authoritative descriptor for a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorSource {
    Blob,
    Container,
    /// No usable descriptor: the admin-only floor applies.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthzDecision {
    pub allow: bool,
    pub source: DescriptorSource,
    pub reason: &'static str,
}

impl AuthzDecision {
    fn allow(source: DescriptorSource, reason: &'static str) -> Self {
        Self { allow: true, source, reason }
    }
    fn deny(source: DescriptorSource, reason: &'static str) -> Self {
        Self { allow: false, source, reason }
    }
}

/// Loads the authoritative descriptor for a target and evaluates a caller against it.
///
/// Lookup order for a blob: `<blob>.auth`, then the container's `.container.auth`.
/// A missing or unreadable descriptor never opens access; it leaves admins only.
#[derive(Clone)]
pub struct AuthorizationResolver {
    store: Arc<dyn DescriptorStore>,
    admin_role: String,
}

impl AuthorizationResolver {
    pub fn new(store: Arc<dyn DescriptorStore>, admin_role: impl Into<String>) -> Self {
        Self { store, admin_role: admin_role.into() }
    }

    pub fn admin_role(&self) -> &str {
        &self.admin_role
    }

    pub fn is_admin(&self, principal: &Principal) -> bool {
        is_admin(principal, &self.admin_role)
    }

    pub fn container_descriptor_exists(&self, container: &str) -> bool {
        self.store.exists(&DescriptorKey::container(container))
    }

    pub fn blob_descriptor_exists(&self, container: &str, blob_path: &str) -> bool {
        self.store.exists(&DescriptorKey::blob(container, blob_path))
    }

    /// Resolve the authoritative descriptor. `None` means "fall to the admin floor";
    /// corrupt records are logged here and never surfaced.
    fn authoritative(&self, target: Target<'_>) -> Option<(AccessDescriptor, DescriptorSource)> {
        if let Target::Blob { container, path } = target {
            let key = DescriptorKey::blob(container, path);
            match self.store.load(&key) {
                DescriptorLookup::Found(d) => return Some((d, DescriptorSource::Blob)),
                DescriptorLookup::Corrupt(why) => {
                    // A broken blob descriptor does not fall back to the container:
                    // the container may be more permissive than the blob intended.
                    warn!(target: "authz", key = %key, "unreadable blob descriptor, admin-only: {}", why);
                    return None;
                }
                DescriptorLookup::Missing => {}
            }
        }
        let key = DescriptorKey::container(target.container_name());
        match self.store.load(&key) {
            DescriptorLookup::Found(d) => Some((d, DescriptorSource::Container)),
            DescriptorLookup::Corrupt(why) => {
                warn!(target: "authz", key = %key, "unreadable container descriptor, admin-only: {}", why);
                None
            }
            DescriptorLookup::Missing => None,
        }
    }

    pub fn decide(&self, target: Target<'_>, principal: &Principal, permission: Permission) -> AuthzDecision {
        let decision = match self.authoritative(target) {
            None => {
                if self.is_admin(principal) {
                    AuthzDecision::allow(DescriptorSource::None, "admin")
                } else {
                    AuthzDecision::deny(DescriptorSource::None, "no_descriptor")
                }
            }
            Some((d, source)) => match permission {
                Permission::Read => {
                    if d.is_public() {
                        AuthzDecision::allow(source, "public")
                    } else if d.is_owner(principal) {
                        AuthzDecision::allow(source, "owner")
                    } else if d.lists_user(principal) {
                        AuthzDecision::allow(source, "user_listed")
                    } else if d.lists_any_role_of(principal) {
                        AuthzDecision::allow(source, "role_listed")
                    } else if self.is_admin(principal) {
                        AuthzDecision::allow(source, "admin")
                    } else {
                        AuthzDecision::deny(source, "not_listed")
                    }
                }
                Permission::Write => {
                    if d.grants_write(principal) {
                        AuthzDecision::allow(source, "owner")
                    } else if self.is_admin(principal) {
                        AuthzDecision::allow(source, "admin")
                    } else {
                        AuthzDecision::deny(source, "not_owner")
                    }
                }
            },
        };
        debug!(
            target: "authz",
            user = %principal.user_id,
            ?permission,
            ?target,
            allow = decision.allow,
            source = ?decision.source,
            reason = decision.reason,
            "authorization decision"
        );
        decision
    }

    pub fn can_read(&self, target: Target<'_>, principal: &Principal) -> bool {
        self.decide(target, principal, Permission::Read).allow
    }

    pub fn can_write(&self, target: Target<'_>, principal: &Principal) -> bool {
        self.decide(target, principal, Permission::Write).allow
    }

    /// Container gate for uploads: the caller must be the owner, listed by user or
    /// role, or an admin. The public flag opens reads only, never uploads.
    pub fn can_upload_into(&self, container: &str, principal: &Principal) -> bool {
        let allowed = match self.authoritative(Target::Container(container)) {
            Some((d, _)) => d.grants_membership(principal) || self.is_admin(principal),
            None => self.is_admin(principal),
        };
        debug!(target: "authz", user = %principal.user_id, container, allowed, "container upload gate");
        allowed
    }
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod resolver_tests;
