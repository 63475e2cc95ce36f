//! Access application metadata discovery
//!
//! An unauthenticated request to an Access-protected host is redirected to the
//! team's login page. The redirect target, the `kid` query parameter and the
//! `CF-Access-*` response headers together identify the application:
//! auth domain, app domain and AUD tag.
//!
//! [`AppInfoResolver`] performs the strict, single-request resolution.
//! [`AppInfoDiscovery`] layers progressively looser fallbacks on top of it.

use std::sync::Arc;
use std::time::Duration;

use access_ssh_proto::{AccessHeader, Failure, ACCESS_LOGIN_PATH, DEFAULT_USER_AGENT};
use tracing::{debug, info, warn};
use url::Url;

use crate::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};

/// Metadata identifying an Access application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub auth_domain: String,
    pub app_aud: String,
    pub app_domain: String,
}

impl AppInfo {
    /// Strict parse of the response to a redirect-following HEAD request.
    ///
    /// The final URL host is the auth domain, `CF-Access-Domain` is the app
    /// domain. The AUD comes from the login page's `kid` parameter when the
    /// request landed there, else from `CF-Access-Aud`.
    pub fn parse(request_url: &Url, response: &HttpResponse) -> Result<Self, Failure> {
        let auth_domain = response
            .url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Failure::protocol_violation("response is missing final URL host"))?
            .to_string();

        let app_domain = response
            .header(AccessHeader::Domain.as_str())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                Failure::protocol_violation(format!(
                    "missing {} header",
                    AccessHeader::Domain.as_str()
                ))
            })?
            .to_string();

        let app_aud = if response.url.path().contains(ACCESS_LOGIN_PATH) {
            query_value(&response.url, "kid").ok_or_else(|| {
                Failure::protocol_violation("login redirect is missing kid query parameter")
            })?
        } else {
            response
                .header(AccessHeader::Aud.as_str())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    Failure::protocol_violation(format!(
                        "unable to resolve app AUD for {}",
                        request_url
                    ))
                })?
        };

        Ok(Self {
            auth_domain,
            app_aud,
            app_domain,
        })
    }
}

/// First non-empty value of a query parameter
pub(crate) fn query_value(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, value)| key == name && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

/// Strict resolver: one HEAD request following redirects
#[derive(Clone)]
pub struct AppInfoResolver {
    client: Arc<dyn HttpClient>,
    user_agent: String,
    timeout: Option<Duration>,
}

impl AppInfoResolver {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self {
            client,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn resolve(&self, app_url: &Url) -> Result<AppInfo, Failure> {
        let mut request = HttpRequest::head(app_url.clone()).with_user_agent(&self.user_agent);
        if let Some(timeout) = self.timeout {
            request = request.with_timeout(timeout);
        }
        let response = self.client.send(request).await?;
        AppInfo::parse(app_url, &response)
    }
}

/// Layered discovery used by the OAuth transfer flow
///
/// Order: strict resolution; HEAD then GET following redirects; HEAD then GET
/// with redirects blocked, reading `Location`; finally, when a team domain
/// hint exists, HEAD then GET accepting any AUD paired with the hint. Every
/// probe error is collected and reported only if all strategies fail.
pub struct AppInfoDiscovery {
    client: Arc<dyn HttpClient>,
    user_agent: String,
    timeout: Duration,
}

impl AppInfoDiscovery {
    pub fn new(client: Arc<dyn HttpClient>, user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
            timeout,
        }
    }

    pub async fn discover(
        &self,
        app_url: &Url,
        team_domain: &str,
        app_domain: &str,
    ) -> Result<AppInfo, Failure> {
        let resolver = AppInfoResolver::new(self.client.clone())
            .with_user_agent(self.user_agent.clone())
            .with_timeout(self.timeout);

        let mut errors: Vec<String> = Vec::new();

        match resolver.resolve(app_url).await {
            Ok(info) => {
                debug!("Resolved Access app metadata for {} (strict)", app_url);
                return Ok(info);
            }
            Err(e) => errors.push(format!("strict: {}", e)),
        }

        let hints = Hints::new(app_url, team_domain, app_domain);

        for method in [HttpMethod::Head, HttpMethod::Get] {
            match self.send(app_url, method, true).await {
                Ok(response) => {
                    let aud = aud_from(&response.url, &response, app_url);
                    let header_domain = response.header(AccessHeader::Domain.as_str());
                    if let Some(info) =
                        hints.make_info(response.url.host_str(), header_domain, aud.as_deref())
                    {
                        info!("Resolved Access app metadata via {} redirect chain", method);
                        return Ok(info);
                    }
                    errors.push(format!("{}-follow: no AUD in final response", method));
                }
                Err(e) => errors.push(format!("{}-follow: {}", method, e)),
            }
        }

        for method in [HttpMethod::Head, HttpMethod::Get] {
            match self.send(app_url, method, false).await {
                Ok(response) => {
                    let Some(location) = response
                        .header("Location")
                        .and_then(|location| app_url.join(location).ok())
                    else {
                        continue;
                    };
                    let aud = aud_from(&location, &response, app_url);
                    let header_domain = response.header(AccessHeader::Domain.as_str());
                    if let Some(info) =
                        hints.make_info(location.host_str(), header_domain, aud.as_deref())
                    {
                        info!("Resolved Access app metadata via {} Location header", method);
                        return Ok(info);
                    }
                    errors.push(format!("{}-location: no AUD in redirect", method));
                }
                Err(e) => errors.push(format!("{}-location: {}", method, e)),
            }
        }

        if !hints.team.is_empty() {
            for method in [HttpMethod::Head, HttpMethod::Get] {
                match self.send(app_url, method, true).await {
                    Ok(response) => {
                        if let Some(aud) = aud_from(&response.url, &response, app_url) {
                            warn!(
                                "Using team domain hint {} for Access app metadata",
                                hints.team
                            );
                            let app_domain = if hints.app_domain.is_empty() {
                                response.url.host_str().unwrap_or_default().to_string()
                            } else {
                                hints.app_domain.clone()
                            };
                            return Ok(AppInfo {
                                auth_domain: hints.team.clone(),
                                app_aud: aud,
                                app_domain,
                            });
                        }
                        errors.push(format!("hint-{}: no AUD", method));
                    }
                    Err(e) => errors.push(format!("hint-{}: {}", method, e)),
                }
            }
        }

        let details = if errors.is_empty() {
            "no Access redirect/AUD discovered".to_string()
        } else {
            errors.join("; ")
        };
        Err(Failure::protocol_violation(format!(
            "unable to resolve Cloudflare OAuth metadata ({})",
            details
        )))
    }

    async fn send(
        &self,
        url: &Url,
        method: HttpMethod,
        follow_redirects: bool,
    ) -> Result<HttpResponse, Failure> {
        let request = HttpRequest::new(method, url.clone())
            .with_user_agent(&self.user_agent)
            .with_timeout(self.timeout)
            .with_follow_redirects(follow_redirects);
        Ok(self.client.send(request).await?)
    }
}

/// Caller supplied hints used when the edge omits headers
struct Hints {
    team: String,
    app_domain: String,
}

impl Hints {
    fn new(app_url: &Url, team_domain: &str, app_domain: &str) -> Self {
        let app_hint = app_domain.trim();
        let app_domain = if app_hint.is_empty() {
            app_url.host_str().unwrap_or_default().to_string()
        } else {
            app_hint.to_string()
        };
        Self {
            team: team_domain.trim().to_string(),
            app_domain,
        }
    }

    fn make_info(
        &self,
        auth_domain: Option<&str>,
        app_domain: Option<&str>,
        aud: Option<&str>,
    ) -> Option<AppInfo> {
        let auth_domain = non_empty(auth_domain).unwrap_or(&self.team);
        let app_domain = non_empty(app_domain).unwrap_or(&self.app_domain);
        let aud = non_empty(aud)?;
        if auth_domain.is_empty() || app_domain.is_empty() {
            return None;
        }
        Some(AppInfo {
            auth_domain: auth_domain.to_string(),
            app_aud: aud.to_string(),
            app_domain: app_domain.to_string(),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// AUD from the URL's `kid`, then `CF-Access-Aud`, then the `Location` `kid`
fn aud_from(url: &Url, response: &HttpResponse, base: &Url) -> Option<String> {
    if let Some(kid) = query_value(url, "kid") {
        return Some(kid);
    }
    if let Some(aud) = non_empty(response.header(AccessHeader::Aud.as_str())) {
        return Some(aud.to_string());
    }
    response
        .header("Location")
        .and_then(|location| base.join(location).ok())
        .and_then(|location| query_value(&location, "kid"))
}
