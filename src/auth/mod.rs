//! Owner authentication
//!
//! Handles:
//! - Password login and logout
//! - Session management
//! - Authentication extractors

mod login;
mod middleware;
pub mod session;

pub use login::auth_router;
pub use middleware::{CurrentUser, MaybeUser};
pub use session::{SESSION_COOKIE, Session, create_session_token, verify_session_token};
