//! Domain types shared by the auth, transport and session layers

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Failure;
use crate::headers::AccessHeader;

/// How the tunnel authenticates against Cloudflare Access
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Interactive browser login delivered through the token transfer service
    OAuth {
        team_domain: String,
        app_domain: String,
        callback_scheme: String,
    },
    /// Static service token credentials
    ServiceToken {
        team_domain: String,
        client_id: String,
        client_secret: String,
    },
}

impl AuthMethod {
    pub fn team_domain(&self) -> &str {
        match self {
            AuthMethod::OAuth { team_domain, .. } => team_domain,
            AuthMethod::ServiceToken { team_domain, .. } => team_domain,
        }
    }

    pub fn is_service_token(&self) -> bool {
        matches!(self, AuthMethod::ServiceToken { .. })
    }
}

// Secrets never end up in logs.
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::OAuth {
                team_domain,
                app_domain,
                callback_scheme,
            } => f
                .debug_struct("OAuth")
                .field("team_domain", team_domain)
                .field("app_domain", app_domain)
                .field("callback_scheme", callback_scheme)
                .finish(),
            AuthMethod::ServiceToken {
                team_domain,
                client_id,
                ..
            } => f
                .debug_struct("ServiceToken")
                .field("team_domain", team_domain)
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
        }
    }
}

/// Credentials attached to the WebSocket upgrade request
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub access_token: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl AuthContext {
    /// Context carrying a bearer Access JWT
    pub fn app_token(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            headers: BTreeMap::new(),
        }
    }

    /// Context carrying service token headers
    pub fn service_token(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(AccessHeader::ClientId.as_str().to_string(), client_id.into());
        headers.insert(
            AccessHeader::ClientSecret.as_str().to_string(),
            client_secret.into(),
        );
        Self {
            access_token: None,
            headers,
        }
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("has_access_token", &self.access_token.is_some())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Resolves an OAuth method to fall back to when a service token is refused.
/// Receives the hostname the caller asked to connect to.
pub type OAuthFallback = Arc<dyn Fn(&str) -> Option<AuthMethod> + Send + Sync>;

/// Observable state of a tunnel session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Authenticating,
    Connecting,
    Connected { local_port: u16 },
    Reconnecting { attempt: u32 },
    Disconnected,
    Failed(Failure),
}

impl ConnectionState {
    /// States from which a new `connect` may start
    pub fn can_start_connection(&self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Failed(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected { local_port } => write!(f, "connected({})", local_port),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting({})", attempt),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed(failure) => write!(f, "failed({})", failure),
        }
    }
}

/// How often and how patiently the session retries a failed tunnel open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_reconnect_attempts: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_reconnect_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_reconnect_attempts,
            base_delay,
        }
    }

    /// Linear backoff: `base_delay * max(1, attempt)`
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.max(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 0,
            base_delay: Duration::from_millis(250),
        }
    }
}

/// Helper module for serializing Duration as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
