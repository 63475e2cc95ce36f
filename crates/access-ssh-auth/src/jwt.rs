//! JWT expiry checks
//!
//! Access tokens are opaque to the tunnel except for their `exp` claim. The
//! signature is never verified here; Cloudflare's edge does that.

use std::sync::Arc;

use access_ssh_proto::Failure;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a given instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Decodes a compact JWT's payload and compares `exp` to a clock
#[derive(Clone)]
pub struct JwtExpiryValidator {
    clock: Arc<dyn Clock>,
}

impl JwtExpiryValidator {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Expiry timestamp in (possibly fractional) seconds since the epoch
    pub fn expiration(&self, token: &str) -> Result<f64, Failure> {
        let parts: Vec<&str> = token.split('.').filter(|part| !part.is_empty()).collect();
        if parts.len() < 2 {
            return Err(Failure::auth("token is not a JWT"));
        }

        let payload = decode_base64url(parts[1])
            .ok_or_else(|| Failure::auth("invalid JWT payload encoding"))?;

        let claims: Value = serde_json::from_slice(&payload)
            .map_err(|_| Failure::auth("invalid JWT payload"))?;
        let Value::Object(claims) = claims else {
            return Err(Failure::auth("invalid JWT payload"));
        };

        claims
            .get("exp")
            .and_then(Value::as_f64)
            .ok_or_else(|| Failure::auth("token missing exp claim"))
    }

    /// A token is expired once `exp <= now`
    pub fn is_expired(&self, token: &str) -> Result<bool, Failure> {
        let exp = self.expiration(token)?;
        let now = self.clock.now().timestamp_millis() as f64 / 1000.0;
        Ok(exp <= now)
    }
}

impl Default for JwtExpiryValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode standard or URL-safe base64, with or without padding
pub(crate) fn decode_base64url(segment: &str) -> Option<Vec<u8>> {
    let segment = segment.trim();
    if segment.is_empty() {
        return None;
    }
    let mut normalized = segment.replace('-', "+").replace('_', "/");
    while normalized.len() % 4 != 0 {
        normalized.push('=');
    }
    STANDARD.decode(normalized).ok()
}
