use super::Principal;

/// Per-request state threaded through the orchestrator.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Principal,
    pub request_id: String,
}

impl RequestContext {
    pub fn new(principal: Principal) -> Self {
        Self { principal, request_id: uuid::Uuid::new_v4().to_string() }
    }

    pub fn user_id(&self) -> &str {
        &self.principal.user_id
    }
}
