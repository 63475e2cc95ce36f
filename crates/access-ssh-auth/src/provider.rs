//! Authentication providers
//!
//! Each provider turns an [`AuthMethod`] into the [`AuthContext`] attached to
//! the WebSocket upgrade. The multiplexer is what sessions normally hold.

use std::sync::Arc;

use access_ssh_proto::{AuthContext, AuthMethod, Failure, OAuthFallback};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::jwt::JwtExpiryValidator;
use crate::token_store::TokenStore;

/// Produces an auth context for a hostname
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, hostname: &str, method: &AuthMethod)
        -> Result<AuthContext, Failure>;
}

/// Interactive flow returning a fresh Access JWT
#[async_trait]
pub trait OAuthFlow: Send + Sync {
    async fn fetch_token(
        &self,
        team_domain: &str,
        app_domain: &str,
        callback_scheme: &str,
        hostname: &str,
    ) -> Result<String, Failure>;
}

/// Cache key for an OAuth token: `oauth|team|app|host`
pub fn oauth_cache_key(team_domain: &str, app_domain: &str, hostname: &str) -> String {
    format!("oauth|{}|{}|{}", team_domain, app_domain, hostname)
}

/// Cache-or-fetch OAuth provider
pub struct OAuthProvider {
    flow: Arc<dyn OAuthFlow>,
    store: Arc<dyn TokenStore>,
    validator: JwtExpiryValidator,
}

impl OAuthProvider {
    pub fn new(flow: Arc<dyn OAuthFlow>, store: Arc<dyn TokenStore>) -> Self {
        Self {
            flow,
            store,
            validator: JwtExpiryValidator::new(),
        }
    }

    pub fn with_validator(mut self, validator: JwtExpiryValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Cached token for the key if it is present and unexpired. Expired or
    /// unparsable entries are evicted.
    async fn cached_token(&self, key: &str) -> Result<Option<String>, Failure> {
        let Some(token) = self.store.read_token(key).await? else {
            return Ok(None);
        };

        match self.validator.is_expired(&token) {
            Ok(false) => Ok(Some(token)),
            Ok(true) => {
                debug!("Cached Access token expired, removing");
                self.store.remove_token(key).await?;
                Ok(None)
            }
            Err(e) => {
                warn!("Cached Access token is malformed ({}), removing", e);
                self.store.remove_token(key).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl AuthProvider for OAuthProvider {
    async fn authenticate(
        &self,
        hostname: &str,
        method: &AuthMethod,
    ) -> Result<AuthContext, Failure> {
        let AuthMethod::OAuth {
            team_domain,
            app_domain,
            callback_scheme,
        } = method
        else {
            return Err(Failure::configuration(
                "oauth provider requires oauth auth method",
            ));
        };

        let key = oauth_cache_key(team_domain, app_domain, hostname);
        if let Some(token) = self.cached_token(&key).await? {
            debug!("Using cached Access token for {}", hostname);
            return Ok(AuthContext::app_token(token));
        }

        info!("No valid cached token for {}, starting OAuth login", hostname);
        let token = self
            .flow
            .fetch_token(team_domain, app_domain, callback_scheme, hostname)
            .await?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(Failure::auth("oauth flow returned empty token"));
        }

        match self.validator.is_expired(&token) {
            Ok(false) => {}
            Ok(true) => return Err(Failure::auth("oauth flow returned expired token")),
            Err(_) => return Err(Failure::auth("oauth flow returned invalid token")),
        }

        self.store.write_token(&token, &key).await?;
        Ok(AuthContext::app_token(token))
    }
}

/// Validates static service token credentials
#[derive(Debug, Default, Clone, Copy)]
pub struct ServiceTokenProvider;

impl ServiceTokenProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuthProvider for ServiceTokenProvider {
    async fn authenticate(
        &self,
        _hostname: &str,
        method: &AuthMethod,
    ) -> Result<AuthContext, Failure> {
        let AuthMethod::ServiceToken {
            client_id,
            client_secret,
            ..
        } = method
        else {
            return Err(Failure::configuration(
                "service token provider requires serviceToken auth method",
            ));
        };

        let client_id = client_id.trim();
        let client_secret = client_secret.trim();
        if client_id.is_empty() {
            return Err(Failure::auth("service token client id must not be empty"));
        }
        if client_secret.is_empty() {
            return Err(Failure::auth(
                "service token client secret must not be empty",
            ));
        }

        Ok(AuthContext::service_token(client_id, client_secret))
    }
}

/// Routes by method variant, falling back from service token to OAuth
pub struct AuthMultiplexer {
    oauth: Arc<dyn AuthProvider>,
    service_token: Arc<dyn AuthProvider>,
    fallback: Option<OAuthFallback>,
}

impl AuthMultiplexer {
    pub fn new(oauth: Arc<dyn AuthProvider>, service_token: Arc<dyn AuthProvider>) -> Self {
        Self {
            oauth,
            service_token,
            fallback: None,
        }
    }

    pub fn with_oauth_fallback(mut self, fallback: OAuthFallback) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[async_trait]
impl AuthProvider for AuthMultiplexer {
    async fn authenticate(
        &self,
        hostname: &str,
        method: &AuthMethod,
    ) -> Result<AuthContext, Failure> {
        match method {
            AuthMethod::OAuth { .. } => self.oauth.authenticate(hostname, method).await,
            AuthMethod::ServiceToken { .. } => {
                match self.service_token.authenticate(hostname, method).await {
                    Ok(context) => Ok(context),
                    Err(err) => {
                        let fallback = self.fallback.as_ref().and_then(|resolve| resolve(hostname));
                        match fallback {
                            Some(oauth_method) => {
                                warn!(
                                    "Service token rejected for {} ({}), falling back to OAuth",
                                    hostname, err
                                );
                                self.oauth.authenticate(hostname, &oauth_method).await
                            }
                            None => Err(err),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::FixedClock;
    use crate::token_store::InMemoryTokenStore;
    use chrono::{TimeZone, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NOW: i64 = 1_700_000_000;

    fn jwt(exp: i64) -> String {
        encode(
            &Header::default(),
            &json!({ "sub": "user@example.com", "exp": exp }),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap()
    }

    fn validator() -> JwtExpiryValidator {
        JwtExpiryValidator::with_clock(Arc::new(FixedClock(
            Utc.timestamp_opt(NOW, 0).unwrap(),
        )))
    }

    fn oauth_method() -> AuthMethod {
        AuthMethod::OAuth {
            team_domain: "team.cloudflareaccess.com".to_string(),
            app_domain: "ssh.example.com".to_string(),
            callback_scheme: "accessssh".to_string(),
        }
    }

    fn service_method(id: &str, secret: &str) -> AuthMethod {
        AuthMethod::ServiceToken {
            team_domain: "team.cloudflareaccess.com".to_string(),
            client_id: id.to_string(),
            client_secret: secret.to_string(),
        }
    }

    struct CountingFlow {
        token: String,
        calls: AtomicUsize,
    }

    impl CountingFlow {
        fn new(token: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                token: token.into(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl OAuthFlow for CountingFlow {
        async fn fetch_token(
            &self,
            _team_domain: &str,
            _app_domain: &str,
            _callback_scheme: &str,
            _hostname: &str,
        ) -> Result<String, Failure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.token.clone())
        }
    }

    #[test]
    fn test_cache_key_format() {
        assert_eq!(
            oauth_cache_key("team", "app", "host"),
            "oauth|team|app|host"
        );
    }

    #[tokio::test]
    async fn test_valid_cached_token_skips_flow() {
        let cached = jwt(NOW + 3600);
        let key = oauth_cache_key("team.cloudflareaccess.com", "ssh.example.com", "ssh.example.com");
        let store = Arc::new(InMemoryTokenStore::with_tokens([(key, cached.clone())]));
        let flow = CountingFlow::new(jwt(NOW + 7200));
        let provider = OAuthProvider::new(flow.clone(), store).with_validator(validator());

        let context = provider
            .authenticate("ssh.example.com", &oauth_method())
            .await
            .unwrap();
        assert_eq!(context.access_token, Some(cached));
        assert_eq!(flow.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_cached_token_is_replaced() {
        let key = oauth_cache_key("team.cloudflareaccess.com", "ssh.example.com", "ssh.example.com");
        let store = Arc::new(InMemoryTokenStore::with_tokens([(key.clone(), "garbage")]));
        let fresh = jwt(NOW + 60);
        let flow = CountingFlow::new(format!("  {}\n", fresh));
        let provider =
            OAuthProvider::new(flow.clone(), store.clone()).with_validator(validator());

        let context = provider
            .authenticate("ssh.example.com", &oauth_method())
            .await
            .unwrap();
        assert_eq!(context.access_token, Some(fresh.clone()));
        assert_eq!(flow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.read_token(&key).await.unwrap(), Some(fresh));
    }

    #[tokio::test]
    async fn test_expired_cached_token_is_replaced() {
        let key = oauth_cache_key("team.cloudflareaccess.com", "ssh.example.com", "ssh.example.com");
        let store = Arc::new(InMemoryTokenStore::with_tokens([(key.clone(), jwt(NOW - 1))]));
        let fresh = jwt(NOW + 1);
        let flow = CountingFlow::new(fresh.clone());
        let provider = OAuthProvider::new(flow, store.clone()).with_validator(validator());

        let context = provider
            .authenticate("ssh.example.com", &oauth_method())
            .await
            .unwrap();
        assert_eq!(context.access_token, Some(fresh));
    }

    #[tokio::test]
    async fn test_rejects_bad_fresh_tokens() {
        let cases = [
            ("   ", "oauth flow returned empty token"),
            ("not-a-jwt", "oauth flow returned invalid token"),
        ];
        for (token, message) in cases {
            let provider = OAuthProvider::new(
                CountingFlow::new(token),
                Arc::new(InMemoryTokenStore::new()),
            )
            .with_validator(validator());
            assert_eq!(
                provider
                    .authenticate("ssh.example.com", &oauth_method())
                    .await
                    .unwrap_err(),
                Failure::auth(message)
            );
        }

        let store = Arc::new(InMemoryTokenStore::new());
        let provider = OAuthProvider::new(CountingFlow::new(jwt(NOW - 10)), store.clone())
            .with_validator(validator());
        assert_eq!(
            provider
                .authenticate("ssh.example.com", &oauth_method())
                .await
                .unwrap_err(),
            Failure::auth("oauth flow returned expired token")
        );
        let key = oauth_cache_key("team.cloudflareaccess.com", "ssh.example.com", "ssh.example.com");
        assert_eq!(store.read_token(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oauth_provider_requires_oauth_method() {
        let provider = OAuthProvider::new(
            CountingFlow::new(jwt(NOW + 60)),
            Arc::new(InMemoryTokenStore::new()),
        );
        assert_eq!(
            provider
                .authenticate("ssh.example.com", &service_method("id", "secret"))
                .await
                .unwrap_err(),
            Failure::configuration("oauth provider requires oauth auth method")
        );
    }

    #[tokio::test]
    async fn test_service_token_provider() {
        let provider = ServiceTokenProvider::new();

        let context = provider
            .authenticate("ssh.example.com", &service_method(" id ", "secret"))
            .await
            .unwrap();
        assert_eq!(context, AuthContext::service_token("id", "secret"));

        assert_eq!(
            provider
                .authenticate("ssh.example.com", &service_method("  ", "secret"))
                .await
                .unwrap_err(),
            Failure::auth("service token client id must not be empty")
        );
        assert_eq!(
            provider
                .authenticate("ssh.example.com", &service_method("id", ""))
                .await
                .unwrap_err(),
            Failure::auth("service token client secret must not be empty")
        );
        assert_eq!(
            provider
                .authenticate("ssh.example.com", &oauth_method())
                .await
                .unwrap_err(),
            Failure::configuration("service token provider requires serviceToken auth method")
        );
    }

    #[tokio::test]
    async fn test_multiplexer_routes_oauth() {
        let mut oauth = MockAuthProvider::new();
        oauth
            .expect_authenticate()
            .times(1)
            .returning(|_, _| Ok(AuthContext::app_token("a.b.c")));
        let mut service = MockAuthProvider::new();
        service.expect_authenticate().times(0);

        let mux = AuthMultiplexer::new(Arc::new(oauth), Arc::new(service));
        let context = mux
            .authenticate("ssh.example.com", &oauth_method())
            .await
            .unwrap();
        assert_eq!(context.access_token.as_deref(), Some("a.b.c"));
    }

    #[tokio::test]
    async fn test_multiplexer_falls_back_to_oauth() {
        let mut oauth = MockAuthProvider::new();
        oauth
            .expect_authenticate()
            .withf(|host, method| host == "ssh.example.com" && !method.is_service_token())
            .times(1)
            .returning(|_, _| Ok(AuthContext::app_token("a.b.c")));
        let mut service = MockAuthProvider::new();
        service
            .expect_authenticate()
            .times(1)
            .returning(|_, _| Err(Failure::auth("service token rejected")));

        let mux = AuthMultiplexer::new(Arc::new(oauth), Arc::new(service))
            .with_oauth_fallback(Arc::new(|_: &str| Some(oauth_method())));
        let context = mux
            .authenticate("ssh.example.com", &service_method("id", "secret"))
            .await
            .unwrap();
        assert_eq!(context.access_token.as_deref(), Some("a.b.c"));
    }

    #[tokio::test]
    async fn test_multiplexer_propagates_without_fallback() {
        let mut oauth = MockAuthProvider::new();
        oauth.expect_authenticate().times(0);
        let mut service = MockAuthProvider::new();
        service
            .expect_authenticate()
            .times(2)
            .returning(|_, _| Err(Failure::auth("service token rejected")));
        let service = Arc::new(service);

        let mux = AuthMultiplexer::new(Arc::new(oauth), service.clone())
            .with_oauth_fallback(Arc::new(|_: &str| None));
        assert_eq!(
            mux.authenticate("ssh.example.com", &service_method("id", "secret"))
                .await
                .unwrap_err(),
            Failure::auth("service token rejected")
        );

        let mut oauth = MockAuthProvider::new();
        oauth.expect_authenticate().times(0);
        let mux = AuthMultiplexer::new(Arc::new(oauth), service);
        assert_eq!(
            mux.authenticate("ssh.example.com", &service_method("id", "secret"))
                .await
                .unwrap_err(),
            Failure::auth("service token rejected")
        );
    }
}
