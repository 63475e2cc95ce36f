//! Failure taxonomy shared by every tunnel component

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every error surfaced by the tunnel is one of these kinds.
///
/// Low-level errors (socket, HTTP, WebSocket, crypto) are translated into a
/// `Failure` at the component boundary. Only `Transport` failures carry a
/// retry hint, and only the session acts on it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Failure {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Failure {
    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        Self::Transport {
            message: message.into(),
            retryable,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Wrap an arbitrary error that has no better classification.
    pub fn internal(error: impl std::fmt::Display) -> Self {
        Self::Internal(error.to_string())
    }

    /// True only for transport failures flagged as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                retryable: true,
                ..
            }
        )
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Failure>() {
            Ok(failure) => failure,
            Err(other) => Self::internal(other),
        }
    }
}
