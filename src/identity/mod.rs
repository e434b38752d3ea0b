//! Caller identity as handed to the core by the upstream authenticator.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod adapters;
mod request_context;
mod authorizer;

pub use principal::Principal;
pub use adapters::principal_from_headers;
pub use request_context::RequestContext;
pub use authorizer::is_admin;
