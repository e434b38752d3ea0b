use super::Principal;

/// The admin override. Every authorization path that grants access to admins
/// goes through this predicate, so the back-door stays in one auditable place.
pub fn is_admin(principal: &Principal, admin_role: &str) -> bool {
    !admin_role.is_empty() && principal.has_role(admin_role)
}
