use axum::http::HeaderMap;

use super::principal::Principal;
use crate::security::split_list;

/// Build the caller from the trusted headers set by the upstream authenticator.
/// Returns None when the identity header is missing or blank.
pub fn principal_from_headers(headers: &HeaderMap, identity_header: &str, roles_header: &str) -> Option<Principal> {
    let user_id = headers
        .get(identity_header)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())?
        .to_string();
    let roles = headers
        .get_all(roles_header)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(split_list)
        .collect();
    Some(Principal { user_id, roles })
}
