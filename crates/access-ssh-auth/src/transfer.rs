//! Cloudflare Access token transfer flow
//!
//! The CLI login handshake works without any local callback server:
//!
//! 1. Resolve the application's auth domain and AUD.
//! 2. Generate an ephemeral NaCl box key pair. The base64url public key is the
//!    *transfer ID*.
//! 3. Open `https://<app>/cdn-cgi/access/cli?token=<id>&aud=<aud>&...` in a
//!    browser so the user logs in.
//! 4. Long-poll `login.cloudflareaccess.org` for the token, which the edge
//!    may deliver as plain JSON, a bare JWT, a cookie, a redirect parameter,
//!    or sealed to our public key (`nonce || box`).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use access_ssh_proto::headers::{ACCESS_CLI_PATH, TRANSFER_HOST};
use access_ssh_proto::types::duration_millis;
use access_ssh_proto::{normalize_origin_url, Failure, DEFAULT_USER_AGENT};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::app_info::{query_value, AppInfoDiscovery};
use crate::http::{HttpClient, HttpError, HttpRequest, HttpResponse};
use crate::jwt::decode_base64url;
use crate::provider::OAuthFlow;

/// Response header carrying the edge's box public key
pub const SERVICE_PUBLIC_KEY_HEADER: &str = "service-public-key";

const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;
const MAX_OBSERVATIONS: usize = 10;
const TOKEN_FIELDS: [&str; 3] = ["app_token", "token", "org_token"];

/// Host collaborator that shows the authorize URL to the user
#[async_trait]
pub trait OAuthWebSession: Send + Sync {
    async fn start(&self, authorize_url: &Url) -> Result<(), Failure>;

    async fn stop(&self);

    /// True once the user dismissed the login page
    fn did_cancel_login(&self) -> bool;
}

/// Timeouts and pacing of the transfer flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    #[serde(with = "duration_millis")]
    pub discovery_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub poll_timeout: Duration,
    pub poll_attempts: u32,
    #[serde(with = "duration_millis")]
    pub poll_delay: Duration,
    pub user_agent: String,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(12),
            poll_timeout: Duration::from_secs(60),
            poll_attempts: 14,
            poll_delay: Duration::from_millis(350),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Ephemeral key pair; one per login attempt
pub struct TransferKeyPair {
    transfer_id: String,
    secret: SecretKey,
}

impl TransferKeyPair {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate(&mut OsRng))
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let transfer_id = URL_SAFE.encode(secret.public_key().as_bytes());
        Self {
            transfer_id,
            secret,
        }
    }

    /// base64url of the public key
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Open a `nonce(24) || box` envelope sealed by the edge.
    ///
    /// The envelope may be raw bytes or base64 text. Returns `None` when the
    /// key or payload are malformed or authentication fails.
    pub fn open(&self, service_public_key: &str, envelope: &[u8]) -> Option<Vec<u8>> {
        let key = decode_base64url(service_public_key)?;
        let key: [u8; KEY_LEN] = key.try_into().ok()?;
        let service_key = PublicKey::from(key);

        let payload = std::str::from_utf8(envelope)
            .ok()
            .and_then(decode_base64url)
            .unwrap_or_else(|| envelope.to_vec());
        if payload.len() <= NONCE_LEN {
            return None;
        }

        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        SalsaBox::new(&service_key, &self.secret)
            .decrypt(GenericArray::from_slice(nonce), sealed)
            .ok()
    }
}

/// [`OAuthFlow`] implemented with the Access token transfer service
pub struct TransferOAuthFlow {
    web_session: Arc<dyn OAuthWebSession>,
    client: Arc<dyn HttpClient>,
    settings: TransferSettings,
    transfer_base: Url,
    cancellation: CancellationToken,
}

impl TransferOAuthFlow {
    pub fn new(web_session: Arc<dyn OAuthWebSession>, client: Arc<dyn HttpClient>) -> Result<Self, Failure> {
        let transfer_base = Url::parse(&format!("https://{}/", TRANSFER_HOST))
            .map_err(|e| Failure::internal(format!("invalid transfer host: {}", e)))?;
        Ok(Self {
            web_session,
            client,
            settings: TransferSettings::default(),
            transfer_base,
            cancellation: CancellationToken::new(),
        })
    }

    pub fn with_settings(mut self, settings: TransferSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Token whose cancellation aborts polling
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Base URL of the transfer service (must end with `/`)
    pub fn with_transfer_base(mut self, base: Url) -> Self {
        self.transfer_base = base;
        self
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    fn check_cancelled(&self) -> Result<(), Failure> {
        if self.cancellation.is_cancelled() || self.web_session.did_cancel_login() {
            return Err(cancelled());
        }
        Ok(())
    }

    async fn poll_for_token(&self, keys: &TransferKeyPair) -> Result<String, Failure> {
        let endpoints = [
            (
                "edge",
                self.transfer_base
                    .join(&format!("transfer/{}", keys.transfer_id()))
                    .map_err(|e| Failure::internal(format!("invalid transfer URL: {}", e)))?,
            ),
            (
                "legacy",
                self.transfer_base
                    .join(keys.transfer_id())
                    .map_err(|e| Failure::internal(format!("invalid transfer URL: {}", e)))?,
            ),
        ];

        let attempts = self.settings.poll_attempts.max(1);
        let mut observations = Observations::default();

        for attempt in 1..=attempts {
            self.check_cancelled()?;
            debug!("Polling for Access token (attempt {}/{})", attempt, attempts);

            for (label, endpoint) in &endpoints {
                match self.poll(label, endpoint, keys, &mut observations).await {
                    Ok(Some(token)) => {
                        info!("✅ Received Access token from {} transfer endpoint", label);
                        return Ok(token);
                    }
                    Ok(None) => {}
                    Err(PollError::Timeout) => {
                        debug!("Transfer poll timed out, continuing");
                        break;
                    }
                    Err(PollError::Failed(failure)) => return Err(failure),
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = self.cancellation.cancelled() => return Err(cancelled()),
                    _ = tokio::time::sleep(self.settings.poll_delay) => {}
                }
            }
        }

        warn!("Gave up waiting for Access token after {} attempts", attempts);
        Err(Failure::auth(format!(
            "Timed out waiting for Cloudflare Access token{}",
            observations.summary()
        )))
    }

    async fn poll(
        &self,
        label: &str,
        endpoint: &Url,
        keys: &TransferKeyPair,
        observations: &mut Observations,
    ) -> Result<Option<String>, PollError> {
        let request = HttpRequest::get(endpoint.clone())
            .with_user_agent(&self.settings.user_agent)
            .with_timeout(self.settings.poll_timeout);

        let response = tokio::select! {
            _ = self.cancellation.cancelled() => return Err(PollError::Failed(cancelled())),
            result = self.client.send(request) => match result {
                Ok(response) => response,
                Err(HttpError::Timeout(_)) => return Err(PollError::Timeout),
                Err(e) => return Err(PollError::Failed(e.into())),
            },
        };

        let token = match response.status {
            204 | 404 => None,
            500..=599 => None,
            _ => extract_token(&response, keys),
        };
        observations.record(format!(
            "[{}] status={} bytes={} servicePublicKey={} parsedJWT={}",
            label,
            response.status,
            response.body.len(),
            response.header(SERVICE_PUBLIC_KEY_HEADER).is_some(),
            token.is_some()
        ));

        if (500..=599).contains(&response.status) {
            return Err(PollError::Failed(Failure::transport(
                format!("Cloudflare transfer service returned {}", response.status),
                true,
            )));
        }
        Ok(token)
    }
}

#[async_trait]
impl OAuthFlow for TransferOAuthFlow {
    async fn fetch_token(
        &self,
        team_domain: &str,
        app_domain: &str,
        _callback_scheme: &str,
        hostname: &str,
    ) -> Result<String, Failure> {
        let app_url = normalize_origin_url(hostname)?;
        let discovery = AppInfoDiscovery::new(
            self.client.clone(),
            self.settings.user_agent.clone(),
            self.settings.discovery_timeout,
        );
        let app_info = discovery.discover(&app_url, team_domain, app_domain).await?;

        let keys = TransferKeyPair::generate();
        let authorize_url = build_authorize_url(&app_url, &app_info.app_aud, keys.transfer_id())?;
        info!(
            "Opening Cloudflare Access login for {} (auth domain {})",
            app_info.app_domain, app_info.auth_domain
        );

        let result = match self.web_session.start(&authorize_url).await {
            Ok(()) => self.poll_for_token(&keys).await,
            Err(e) => Err(e),
        };
        self.web_session.stop().await;
        result
    }
}

/// Build the `/cdn-cgi/access/cli` authorize URL for an app origin
pub fn build_authorize_url(app_url: &Url, aud: &str, transfer_id: &str) -> Result<Url, Failure> {
    let mut origin = app_url.clone();
    origin.set_path("");
    origin.set_query(None);
    origin.set_fragment(None);
    if origin.host_str().is_none() {
        return Err(Failure::configuration("hostname is missing host"));
    }

    let mut redirect = origin.clone();
    redirect
        .query_pairs_mut()
        .append_pair("token", transfer_id)
        .append_pair("aud", aud);

    let mut authorize = origin;
    authorize.set_path(ACCESS_CLI_PATH);
    authorize
        .query_pairs_mut()
        .append_pair("token", transfer_id)
        .append_pair("aud", aud)
        .append_pair("redirect_url", redirect.as_str())
        .append_pair("send_org_token", "true")
        .append_pair("edge_token_transfer", "true");

    Ok(authorize)
}

fn cancelled() -> Failure {
    Failure::auth("Cloudflare login was cancelled")
}

enum PollError {
    Timeout,
    Failed(Failure),
}

/// Ring of the most recent poll outcomes, reported on exhaustion
#[derive(Default)]
struct Observations {
    entries: VecDeque<String>,
}

impl Observations {
    fn record(&mut self, entry: String) {
        if self.entries.len() == MAX_OBSERVATIONS {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn summary(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let joined: Vec<&str> = self.entries.iter().map(String::as_str).collect();
        format!(" ({})", joined.join(" || "))
    }
}

/// Find a token anywhere the edge may have put it, in priority order
fn extract_token(response: &HttpResponse, keys: &TransferKeyPair) -> Option<String> {
    if let Some(token) = token_from_payload(&response.body) {
        return Some(token);
    }

    if let Some(service_key) = response.header(SERVICE_PUBLIC_KEY_HEADER) {
        match keys.open(service_key, &response.body) {
            Some(plaintext) => {
                if let Some(token) = token_from_payload(&plaintext) {
                    return Some(token);
                }
            }
            None => debug!("Failed to open sealed transfer payload"),
        }
    }

    if let Some(decoded) = std::str::from_utf8(&response.body)
        .ok()
        .and_then(decode_base64url)
    {
        if let Some(token) = token_from_payload(&decoded) {
            return Some(token);
        }
    }

    if let Some(token) = token_from_query(&response.url) {
        return Some(token);
    }

    if let Some(location) = response
        .header("Location")
        .and_then(|location| response.url.join(location).ok())
    {
        if let Some(token) = token_from_query(&location) {
            return Some(token);
        }
    }

    token_from_cookies(response)
}

fn token_from_payload(data: &[u8]) -> Option<String> {
    if let Ok(serde_json::Value::Object(fields)) = serde_json::from_slice(data) {
        for name in TOKEN_FIELDS {
            if let Some(token) = fields
                .get(name)
                .and_then(|value| value.as_str())
                .and_then(normalize_jwt_candidate)
            {
                return Some(token);
            }
        }
    }
    std::str::from_utf8(data).ok().and_then(normalize_jwt_candidate)
}

fn token_from_query(url: &Url) -> Option<String> {
    TOKEN_FIELDS
        .iter()
        .filter_map(|name| query_value(url, name))
        .find_map(|value| normalize_jwt_candidate(&value))
}

fn token_from_cookies(response: &HttpResponse) -> Option<String> {
    let cookies: Vec<(&str, &str)> = response
        .header_values("Set-Cookie")
        .filter_map(|cookie| {
            let pair = cookie.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            Some((name.trim(), value.trim()))
        })
        .collect();

    cookies
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("CF_Authorization"))
        .chain(cookies.iter())
        .find_map(|(_, value)| normalize_jwt_candidate(value))
}

/// Trim whitespace and quotes; accept three non-empty dot-separated parts,
/// percent-decoding first if the raw form does not qualify.
pub(crate) fn normalize_jwt_candidate(value: &str) -> Option<String> {
    let trimmed = value.trim_matches(|c: char| c.is_whitespace() || c == '"');
    if trimmed.is_empty() {
        return None;
    }
    if is_compact_jwt(trimmed) {
        return Some(trimmed.to_string());
    }

    let decoded = urlencoding::decode(trimmed).ok()?;
    let decoded = decoded.trim_matches(|c: char| c.is_whitespace() || c == '"');
    if decoded != trimmed && is_compact_jwt(decoded) {
        return Some(decoded.to_string());
    }
    None
}

fn is_compact_jwt(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').filter(|part| !part.is_empty()).collect();
    parts.len() == 3
        && parts.iter().all(|part| {
            part.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '/' | '='))
        })
}
