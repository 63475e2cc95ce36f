//! Cloudflare Access header names and well-known paths

/// Path prefix of the Access login page an unauthenticated request is
/// redirected to.
pub const ACCESS_LOGIN_PATH: &str = "/cdn-cgi/access/login";

/// Path of the Access CLI authorize endpoint.
pub const ACCESS_CLI_PATH: &str = "/cdn-cgi/access/cli";

/// Host serving the token transfer endpoints.
pub const TRANSFER_HOST: &str = "login.cloudflareaccess.org";

/// Headers exchanged with Cloudflare Access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessHeader {
    /// Bearer Access JWT sent on the WebSocket upgrade
    Token,
    /// Service token client id
    ClientId,
    /// Service token client secret
    ClientSecret,
    /// Optional SSH jump target
    JumpDestination,
    /// Inbound: application domain
    Domain,
    /// Inbound: application AUD tag
    Aud,
}

impl AccessHeader {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AccessHeader::Token => "Cf-Access-Token",
            AccessHeader::ClientId => "Cf-Access-Client-Id",
            AccessHeader::ClientSecret => "Cf-Access-Client-Secret",
            AccessHeader::JumpDestination => "Cf-Access-Jump-Destination",
            AccessHeader::Domain => "CF-Access-Domain",
            AccessHeader::Aud => "CF-Access-Aud",
        }
    }
}

impl std::fmt::Display for AccessHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
