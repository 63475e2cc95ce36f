//! Dialer configuration

use std::time::Duration;

/// Settings for [`crate::TungsteniteDialer`]
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Upper bound on TCP connect + TLS + upgrade
    pub connect_timeout: Duration,

    /// Maximum incoming message size
    pub max_message_size: usize,

    /// Disable Nagle's algorithm on the underlying TCP stream
    pub disable_nagle: bool,
}

impl DialerConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            max_message_size: 16 * 1024 * 1024, // 16MB
            disable_nagle: true,
        }
    }
}
