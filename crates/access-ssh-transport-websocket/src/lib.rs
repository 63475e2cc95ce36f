//! WebSocket transport for Cloudflare Access tunnels
//!
//! The tunnel bridge only needs three operations from a WebSocket: send a
//! binary message, receive the next payload (or learn the peer closed), and
//! close. [`WebSocketClient`] and [`WebSocketDialer`] capture exactly that so
//! tests can substitute scripted sockets; [`TungsteniteDialer`] is the real
//! implementation.

pub mod config;
pub mod connection;
pub mod request;

pub use config::DialerConfig;
pub use connection::{TungsteniteClient, TungsteniteDialer};
pub use request::{AccessRequest, AccessRequestBuilder};

use access_ssh_proto::Failure;
use async_trait::async_trait;

/// An established WebSocket carrying tunnel bytes
#[async_trait]
pub trait WebSocketClient: Send + Sync {
    /// Send one binary message
    async fn send(&self, data: Vec<u8>) -> Result<(), Failure>;

    /// Next payload; `Ok(None)` once the peer closed the socket
    async fn receive(&self) -> Result<Option<Vec<u8>>, Failure>;

    /// Close the socket. Safe to call more than once.
    async fn close(&self);
}

/// Opens WebSockets for Access requests
#[async_trait]
pub trait WebSocketDialer: Send + Sync {
    async fn connect(&self, request: AccessRequest) -> Result<Box<dyn WebSocketClient>, Failure>;
}
