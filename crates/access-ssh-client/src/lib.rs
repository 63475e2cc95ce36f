//! Cloudflare Access tunnel client
//!
//! [`TunnelBridge`] owns a loopback listener and pipes each accepted local
//! client through an Access-authorized WebSocket. [`Session`] sequences
//! authentication, tunnel establishment, retries and OAuth fallback, and
//! publishes [`ConnectionState`] changes to any number of observers.

pub mod bridge;
pub mod config;
pub mod session;
pub mod state;
mod tracker;

pub use bridge::{ConnectionLimits, FaultInjection, OriginResolver, TunnelBridge};
pub use config::SessionConfig;
pub use session::Session;
pub use state::StateStream;

// Re-export useful types
pub use access_ssh_proto::{AuthContext, AuthMethod, ConnectionState, Failure, RetryPolicy};

use async_trait::async_trait;

/// Opens and closes the local tunnel endpoint
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Start listening on loopback and return the local port
    async fn open(
        &self,
        hostname: &str,
        auth: &AuthContext,
        method: &AuthMethod,
    ) -> Result<u16, Failure>;

    /// Stop listening and tear down every bridged connection
    async fn close(&self);
}
