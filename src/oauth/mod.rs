//! OAuth session management for calendar connections.
//!
//! - [`state`]: signed, short-lived state tokens round-tripped through the provider
//! - [`client`]: the provider's authorization, token and revocation endpoints
//! - [`tokens`]: refresh-before-use policy for stored access tokens

pub mod client;
pub mod state;
pub mod tokens;

pub use client::{GoogleOAuthClient, OAuthError, OAuthSettings, RefreshedToken, TokenSet};
pub use state::{StateClaims, StateSigner, StateTokenError};
pub use tokens::{TokenError, TokenManager};
