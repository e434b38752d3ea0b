use chrono::Utc;

use super::descriptor::{AccessDescriptor, AccessLevel};
use crate::storage::Metadata;

pub const META_ACCESS: &str = "access";
pub const META_ROLES: &str = "roles";
pub const META_USERS: &str = "users";
pub const META_PUBLIC: &str = "public";

/// Split a comma-separated header value into trimmed, non-empty entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn push_unique_ci(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v.eq_ignore_ascii_case(value)) {
        list.push(value.to_string());
    }
}

fn dedup_ci(values: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        push_unique_ci(&mut out, &v);
    }
    out
}

fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn has_value(metadata: &Metadata, key: &str) -> bool {
    metadata.get(key).map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// True when a write carries any access-control signal: a `roles` or `users`
/// list, an explicit `access` level, or a boolean-style `public` flag.
pub fn carries_access_signals(metadata: &Metadata) -> bool {
    has_value(metadata, META_ROLES)
        || has_value(metadata, META_USERS)
        || has_value(metadata, META_ACCESS)
        || metadata.get(META_PUBLIC).map(is_truthy).unwrap_or(false)
}

/// Build a descriptor for `caller` from upload metadata.
///
/// The caller becomes owner and is always listed in `users_allowed`. An empty
/// role list becomes `[admin_role]` so a descriptor never locks admins out.
/// `public` is additive: explicit user and role lists are kept alongside it.
pub fn derive_descriptor(caller: &str, metadata: &Metadata, admin_role: &str) -> AccessDescriptor {
    let mut roles_allowed = dedup_ci(metadata.get(META_ROLES).map(split_list).unwrap_or_default());
    let mut users_allowed = dedup_ci(metadata.get(META_USERS).map(split_list).unwrap_or_default());
    push_unique_ci(&mut users_allowed, caller);
    if roles_allowed.is_empty() {
        roles_allowed.push(admin_role.to_string());
    }

    let explicit_public = metadata.get(META_PUBLIC).map(is_truthy).unwrap_or(false);
    let access = match metadata.get(META_ACCESS) {
        Some(raw) => AccessLevel::parse(raw),
        None if explicit_public => AccessLevel::Public,
        None => AccessLevel::Private,
    };

    AccessDescriptor {
        owner: caller.to_string(),
        roles_allowed,
        users_allowed,
        created_utc: Some(Utc::now()),
        created_by: caller.to_string(),
        access,
    }
}
