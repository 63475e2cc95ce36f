//! Session configuration

use std::sync::Arc;
use std::time::Duration;

use access_ssh_auth::AuthProvider;
use access_ssh_proto::types::duration_millis;
use access_ssh_proto::{RetryPolicy, DEFAULT_USER_AGENT};
use access_ssh_transport_websocket::{
    AccessRequestBuilder, DialerConfig, TungsteniteDialer, WebSocketDialer,
};
use serde::{Deserialize, Serialize};

use crate::bridge::{ConnectionLimits, TunnelBridge};
use crate::session::Session;

/// Everything a host needs to set up a tunnel session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub retry: RetryPolicy,
    pub limits: ConnectionLimits,
    /// Jump destination for Access for Infrastructure targets
    pub destination: Option<String>,
    pub user_agent: String,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            limits: ConnectionLimits::default(),
            destination: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Tunnel bridge using the real WebSocket dialer
    pub fn tunnel_bridge(&self) -> TunnelBridge {
        let dialer = TungsteniteDialer::new(
            DialerConfig::default().with_connect_timeout(self.connect_timeout),
        );
        self.tunnel_bridge_with(Arc::new(dialer))
    }

    pub fn tunnel_bridge_with(&self, dialer: Arc<dyn WebSocketDialer>) -> TunnelBridge {
        let bridge = TunnelBridge::new(dialer)
            .with_limits(self.limits)
            .with_request_builder(AccessRequestBuilder::new().with_user_agent(&self.user_agent));
        match &self.destination {
            Some(destination) => bridge.with_destination(destination.clone()),
            None => bridge,
        }
    }

    pub fn session(&self, auth: Arc<dyn AuthProvider>, tunnel: Arc<TunnelBridge>) -> Session {
        Session::new(auth, tunnel).with_retry_policy(self.retry)
    }
}

/// Builder for SessionConfig
#[derive(Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn limits(mut self, limits: ConnectionLimits) -> Self {
        self.config.limits = limits;
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.config.destination = Some(destination.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<SessionConfig, String> {
        if self.config.user_agent.trim().is_empty() {
            return Err("user_agent must not be empty".to_string());
        }
        if self.config.connect_timeout.is_zero() {
            return Err("connect_timeout must be greater than zero".to_string());
        }
        if let Some(destination) = &self.config.destination {
            if destination.trim().is_empty() {
                return Err("destination must not be blank".to_string());
            }
        }
        Ok(self.config)
    }
}
