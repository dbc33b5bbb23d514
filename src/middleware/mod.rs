pub mod auth;
pub mod rate_limit;

pub use auth::{extract_bearer_or_cookie, extract_ip, require_admin, require_session};
