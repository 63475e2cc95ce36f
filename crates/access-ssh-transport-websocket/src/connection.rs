//! tokio-tungstenite backed WebSocket client

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use access_ssh_proto::Failure;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::config::DialerConfig;
use crate::request::AccessRequest;
use crate::{WebSocketClient, WebSocketDialer};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Established WebSocket split into independently locked halves, so a
/// pending `receive` never blocks `send` or `close`.
pub struct TungsteniteClient {
    connection_id: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
    source: Mutex<SplitStream<WsStream>>,
    created_at: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for TungsteniteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TungsteniteClient")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TungsteniteClient {
    pub fn new(stream: WsStream) -> Self {
        let (sink, source) = stream.split();
        Self {
            connection_id: format!("ws-{}", uuid::Uuid::new_v4()),
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            created_at: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    fn record_received(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl WebSocketClient for TungsteniteClient {
    async fn send(&self, data: Vec<u8>) -> Result<(), Failure> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Failure::transport("websocket is closed", false));
        }

        let len = data.len();
        self.sink
            .lock()
            .await
            .send(Message::Binary(data))
            .await
            .map_err(|e| Failure::transport(format!("websocket send failed: {}", e), true))?;
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        trace!("[{}] sent {} bytes", self.connection_id, len);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, Failure> {
        let mut source = self.source.lock().await;
        loop {
            match source.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.record_received(data.len());
                    return Ok(Some(data));
                }
                Some(Ok(Message::Text(text))) => {
                    self.record_received(text.len());
                    return Ok(Some(text.into_bytes()));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("[{}] peer closed websocket: {:?}", self.connection_id, frame);
                    return Ok(None);
                }
                // Pings are answered by tungstenite on the next write/flush
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                    continue
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                    return Ok(None)
                }
                Some(Err(e)) => {
                    return Err(Failure::transport(
                        format!("websocket receive failed: {}", e),
                        true,
                    ))
                }
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("[{}] websocket close: {}", self.connection_id, e);
        }
        debug!(
            "[{}] closed after {:?} (sent {} bytes, received {} bytes)",
            self.connection_id,
            self.created_at.elapsed(),
            self.bytes_sent(),
            self.bytes_received()
        );
    }
}

/// Dials WebSockets with tokio-tungstenite (rustls, native roots)
#[derive(Debug, Clone, Default)]
pub struct TungsteniteDialer {
    config: DialerConfig,
}

impl TungsteniteDialer {
    pub fn new(config: DialerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WebSocketDialer for TungsteniteDialer {
    async fn connect(&self, request: AccessRequest) -> Result<Box<dyn WebSocketClient>, Failure> {
        let mut upgrade = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Failure::configuration(format!("invalid websocket URL: {}", e)))?;

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Failure::configuration(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Failure::configuration(format!("invalid value for header {}: {}", name, e)))?;
            upgrade.headers_mut().insert(name, value);
        }

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        debug!("Dialing websocket {}", request.url);
        let connect = tokio_tungstenite::connect_async_with_config(
            upgrade,
            Some(ws_config),
            self.config.disable_nagle,
        );
        let (stream, response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                Failure::transport(
                    format!("timed out connecting to {}", request.url),
                    true,
                )
            })?
            .map_err(classify_connect_error)?;

        debug!(
            "WebSocket upgrade to {} completed with status {}",
            request.url,
            response.status()
        );
        Ok(Box::new(TungsteniteClient::new(stream)))
    }
}

fn classify_connect_error(err: WsError) -> Failure {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                Failure::auth(format!("access denied by edge (HTTP {})", status))
            } else {
                warn!("WebSocket upgrade rejected with HTTP {}", status);
                Failure::transport(format!("websocket upgrade rejected (HTTP {})", status), status >= 500)
            }
        }
        WsError::Io(e) => Failure::transport(format!("websocket connect failed: {}", e), true),
        WsError::Tls(e) => Failure::transport(format!("TLS handshake failed: {}", e), false),
        WsError::Url(e) => Failure::configuration(format!("invalid websocket URL: {}", e)),
        other => Failure::protocol_violation(format!("websocket handshake failed: {}", other)),
    }
}
