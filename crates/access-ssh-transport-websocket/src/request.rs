//! Access-authorized WebSocket upgrade requests

use access_ssh_proto::{AccessHeader, AuthContext, DEFAULT_USER_AGENT};
use url::Url;

/// A WebSocket URL plus the headers to send with the upgrade
#[derive(Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl AccessRequest {
    /// First header with this name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl std::fmt::Debug for AccessRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessRequest")
            .field("url", &self.url.as_str())
            .field(
                "headers",
                &self.headers.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builds upgrade requests carrying Access credentials
#[derive(Debug, Clone)]
pub struct AccessRequestBuilder {
    user_agent: String,
}

impl AccessRequestBuilder {
    pub fn new() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Request for `url` with the context's token and headers, an optional jump
    /// destination, and any extra headers. Empty token or destination are
    /// skipped.
    pub fn build(
        &self,
        url: &Url,
        auth: &AuthContext,
        destination: Option<&str>,
        additional_headers: &[(String, String)],
    ) -> AccessRequest {
        let mut headers = vec![("User-Agent".to_string(), self.user_agent.clone())];

        if let Some(token) = auth.access_token.as_deref().filter(|t| !t.is_empty()) {
            headers.push((AccessHeader::Token.as_str().to_string(), token.to_string()));
        }

        for (name, value) in &auth.headers {
            headers.push((name.clone(), value.clone()));
        }

        if let Some(destination) = destination.filter(|d| !d.is_empty()) {
            headers.push((
                AccessHeader::JumpDestination.as_str().to_string(),
                destination.to_string(),
            ));
        }

        headers.extend(additional_headers.iter().cloned());

        AccessRequest {
            url: url.clone(),
            headers,
        }
    }
}

impl Default for AccessRequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
