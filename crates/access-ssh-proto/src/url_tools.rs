//! Hostname normalization and WebSocket URL derivation

use tracing::debug;
use url::Url;

use crate::error::Failure;
use crate::headers::ACCESS_LOGIN_PATH;

/// Turn a user supplied hostname into an `https` origin URL.
///
/// Accepts bare hosts (`ssh.example.com`), hosts with a port or path, and full
/// URLs of any scheme. The scheme is always forced to `https`; host, port and
/// path are preserved.
pub fn normalize_origin_url(hostname: &str) -> Result<Url, Failure> {
    let trimmed = hostname.trim();
    if trimmed.is_empty() {
        return Err(Failure::configuration("hostname must not be empty"));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let mut url = Url::parse(&candidate).map_err(|err| match err {
        url::ParseError::EmptyHost => Failure::configuration("hostname is missing host"),
        other => Failure::configuration(format!("invalid hostname {}: {}", trimmed, other)),
    })?;

    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => return Err(Failure::configuration("hostname is missing host")),
    };

    if url.scheme() != "https" && url.set_scheme("https").is_err() {
        // Non-special schemes (ssh://, tcp://) cannot be switched in place.
        let mut rebuilt = format!("https://{}", host);
        if let Some(port) = url.port() {
            rebuilt.push_str(&format!(":{}", port));
        }
        rebuilt.push_str(url.path());
        url = Url::parse(&rebuilt).map_err(|err| {
            Failure::configuration(format!("invalid hostname {}: {}", trimmed, err))
        })?;
    }

    debug!("Normalized hostname {} to origin {}", trimmed, url);
    Ok(url)
}

/// Canonical host of an Access hostname: lowercase, no scheme, port or path.
/// Cache keys and providers are keyed by this value.
pub fn normalize_host(hostname: &str) -> Result<String, Failure> {
    let origin = normalize_origin_url(hostname)?;
    origin
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| Failure::configuration("hostname is missing host"))
}

/// Derive the WebSocket URL for an origin: `https → wss`, `http → ws`,
/// `ws`/`wss` unchanged.
pub fn websocket_url(origin: &Url) -> Result<Url, Failure> {
    let scheme = match origin.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(Failure::protocol_violation(format!(
                "unsupported scheme {}",
                other
            )))
        }
    };

    let mut url = origin.clone();
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| Failure::internal(format!("cannot rewrite scheme of {}", origin)))?;
    }
    Ok(url)
}

/// True when a response is the Access redirect to the login page.
pub fn is_access_login_redirect(status: u16, location: Option<&str>) -> bool {
    if status != 302 {
        return false;
    }
    let Some(location) = location else {
        return false;
    };

    let path = match Url::parse(location) {
        Ok(url) => url.path().to_string(),
        Err(_) => location.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    path.starts_with(ACCESS_LOGIN_PATH)
}
