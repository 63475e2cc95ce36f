//! Session state machine
//!
//! `connect` runs authenticate → open with the retry policy, publishing every
//! transition. A service-token connect that fails in either step is re-run
//! once with the OAuth fallback method, when one is configured. Only one
//! connect may be in flight; a second one is rejected with `invalid_state`.

use std::sync::Arc;

use access_ssh_auth::AuthProvider;
use access_ssh_proto::{
    normalize_host, AuthContext, AuthMethod, ConnectionState, Failure, OAuthFallback, RetryPolicy,
};
use tracing::{debug, info, warn};

use crate::state::{StateHub, StateStream};
use crate::TunnelProvider;

pub struct Session {
    auth: Arc<dyn AuthProvider>,
    tunnel: Arc<dyn TunnelProvider>,
    retry: RetryPolicy,
    oauth_fallback: Option<OAuthFallback>,
    hub: StateHub,
}

impl Session {
    pub fn new(auth: Arc<dyn AuthProvider>, tunnel: Arc<dyn TunnelProvider>) -> Self {
        Self {
            auth,
            tunnel,
            retry: RetryPolicy::default(),
            oauth_fallback: None,
            hub: StateHub::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolver for the OAuth method to use when a service-token connect fails
    pub fn with_oauth_fallback(mut self, fallback: OAuthFallback) -> Self {
        self.oauth_fallback = Some(fallback);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.hub.current()
    }

    /// Observe state changes. The stream starts with the current state.
    pub fn subscribe(&self) -> StateStream {
        self.hub.subscribe()
    }

    /// Authenticate and open the tunnel, returning the local port
    pub async fn connect(&self, hostname: &str, method: AuthMethod) -> Result<u16, Failure> {
        let host = self.hub.begin_connect(|| normalize_host(hostname))?;
        info!("Connecting to {}", host);

        let failure = match self.connect_with(&host, &method).await {
            Ok(local_port) => return Ok(local_port),
            Err(failure) => failure,
        };

        let fallback = match &self.oauth_fallback {
            Some(resolve) if method.is_service_token() => resolve(&host),
            _ => None,
        };
        let Some(oauth_method) = fallback else {
            return Err(self.fail(failure));
        };

        warn!(
            "Service token connect to {} failed ({}), retrying with OAuth",
            host, failure
        );
        self.hub.publish(ConnectionState::Authenticating);
        self.connect_with(&host, &oauth_method)
            .await
            .map_err(|failure| self.fail(failure))
    }

    /// Close the tunnel. Always ends in `disconnected`.
    pub async fn disconnect(&self) {
        self.tunnel.close().await;
        self.hub.publish(ConnectionState::Disconnected);
        info!("Disconnected");
    }

    async fn connect_with(&self, host: &str, method: &AuthMethod) -> Result<u16, Failure> {
        let auth = self.auth.authenticate(host, method).await?;
        self.open_with_retry(host, &auth, method).await
    }

    async fn open_with_retry(
        &self,
        hostname: &str,
        auth: &AuthContext,
        method: &AuthMethod,
    ) -> Result<u16, Failure> {
        let mut attempt = 0;
        loop {
            self.hub.publish(ConnectionState::Connecting);
            let failure = match self.tunnel.open(hostname, auth, method).await {
                Ok(local_port) => {
                    self.hub.publish(ConnectionState::Connected { local_port });
                    info!("✅ Tunnel ready on 127.0.0.1:{}", local_port);
                    return Ok(local_port);
                }
                Err(failure) => failure,
            };

            if !failure.is_retryable() || attempt >= self.retry.max_reconnect_attempts {
                return Err(failure);
            }

            attempt += 1;
            let delay = self.retry.delay(attempt);
            warn!(
                "Tunnel open failed ({}), reconnect attempt {} in {:?}",
                failure, attempt, delay
            );
            self.hub.publish(ConnectionState::Reconnecting { attempt });
            tokio::time::sleep(delay).await;
        }
    }

    fn fail(&self, failure: Failure) -> Failure {
        debug!("Connect failed: {:?}", failure);
        self.hub.publish(ConnectionState::Failed(failure.clone()));
        failure
    }
}
