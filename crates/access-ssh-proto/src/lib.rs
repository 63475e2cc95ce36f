//! Cloudflare Access tunnel protocol definitions
//!
//! This crate defines the types shared by every layer of the tunnel: the
//! failure taxonomy, authentication methods and contexts, the connection
//! state machine's states, the retry policy, the Access header names, and the
//! URL helpers used to turn a user supplied hostname into an origin.

pub mod error;
pub mod headers;
pub mod types;
pub mod url_tools;

pub use error::Failure;
pub use headers::{AccessHeader, ACCESS_LOGIN_PATH};
pub use types::{AuthContext, AuthMethod, ConnectionState, OAuthFallback, RetryPolicy};
pub use url_tools::{
    is_access_login_redirect, normalize_host, normalize_origin_url, websocket_url,
};

/// Default user agent sent with every Access request
pub const DEFAULT_USER_AGENT: &str = concat!("access-ssh/", env!("CARGO_PKG_VERSION"));
