//! OAuth2 authorization server core.
//!
//! ## Supported Grants
//!
//! - Resource Owner Password Credentials
//! - Refresh Token
//! - Client Credentials
//!
//! ## Endpoints
//!
//! - `POST /oauth2/token` - Token endpoint
//! - `POST /oauth2/introspect` - Token introspection
//! - `POST /oauth2/revoke` - Token revocation

pub mod arguments;
pub mod client;
pub mod endpoints;
pub mod engine;
pub mod password_grant;
pub mod requester;
mod state;
pub mod strategy;

pub use endpoints::router;
pub use engine::{OAuth2Engine, TokenLifetimes, TokenResponse};
pub use state::OAuth2State;

/// OpenAPI tag for OAuth2 endpoints
pub const OAUTH2_TAG: &str = "OAuth2";
