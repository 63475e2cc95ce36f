//! Cloudflare Access authentication
//!
//! Providers that turn an [`AuthMethod`] into an [`AuthContext`]: a cached
//! OAuth provider backed by the token transfer flow, a service token provider,
//! and a multiplexer routing between them with an optional OAuth fallback.

pub mod app_info;
pub mod http;
pub mod jwt;
pub mod provider;
pub mod token_store;
pub mod transfer;

pub use app_info::{AppInfo, AppInfoDiscovery, AppInfoResolver};
pub use http::{HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use jwt::{Clock, FixedClock, JwtExpiryValidator, SystemClock};
pub use provider::{
    oauth_cache_key, AuthMultiplexer, AuthProvider, OAuthFlow, OAuthProvider,
    ServiceTokenProvider,
};
pub use token_store::{FileTokenStore, InMemoryTokenStore, TokenStore};
pub use transfer::{OAuthWebSession, TransferKeyPair, TransferOAuthFlow, TransferSettings};

// Re-export useful types
pub use access_ssh_proto::{AuthContext, AuthMethod, Failure, OAuthFallback};
pub use async_trait::async_trait;
