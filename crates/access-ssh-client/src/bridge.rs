//! Loopback listener bridged to Cloudflare Access WebSockets
//!
//! `open` binds `127.0.0.1:0`, spawns an accept loop and returns the port at
//! once. Every accepted local client gets its own WebSocket and a pair of
//! pumps; whichever side closes first tears the pair down.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use access_ssh_proto::{normalize_origin_url, websocket_url, AuthContext, AuthMethod, Failure};
use access_ssh_transport_websocket::{
    AccessRequest, AccessRequestBuilder, WebSocketClient, WebSocketDialer,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::tracker::BridgeTracker;
use crate::TunnelProvider;

const LOOPBACK: &str = "127.0.0.1";
const LISTEN_BACKLOG: u32 = 1024;
const PUMP_BUFFER_SIZE: usize = 16 * 1024;

/// Maps a hostname to the origin URL the WebSocket is derived from
pub type OriginResolver = Arc<dyn Fn(&str) -> Result<Url, Failure> + Send + Sync>;

/// How many local clients the bridge serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionLimits {
    /// Live bridges allowed at once (at least 1)
    pub max_concurrent_connections: usize,
    /// Close the listener right after the first client is accepted
    pub stop_accepting_after_first_connection: bool,
}

impl ConnectionLimits {
    pub fn new(max_concurrent_connections: usize, stop_accepting_after_first_connection: bool) -> Self {
        Self {
            max_concurrent_connections: max_concurrent_connections.max(1),
            stop_accepting_after_first_connection,
        }
    }

    fn max_connections(&self) -> usize {
        self.max_concurrent_connections.max(1)
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::new(1, true)
    }
}

/// Socket setup step forced to fail, for exercising error paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultInjection {
    Socket,
    InetPton,
    Bind,
    Listen,
    Getsockname,
}

struct ListenerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct BridgeState {
    open: bool,
    listener: Option<ListenerTask>,
}

/// Everything the accept loop needs, shared with each bridge it spawns
struct AcceptContext {
    dialer: Arc<dyn WebSocketDialer>,
    request: AccessRequest,
    limits: ConnectionLimits,
    bridges: Arc<BridgeTracker>,
}

/// [`TunnelProvider`] serving a loopback port over Access WebSockets
pub struct TunnelBridge {
    dialer: Arc<dyn WebSocketDialer>,
    request_builder: AccessRequestBuilder,
    origin_resolver: OriginResolver,
    limits: ConnectionLimits,
    destination: Option<String>,
    fault: Option<FaultInjection>,
    state: Mutex<BridgeState>,
    bridges: Arc<BridgeTracker>,
}

impl TunnelBridge {
    pub fn new(dialer: Arc<dyn WebSocketDialer>) -> Self {
        Self {
            dialer,
            request_builder: AccessRequestBuilder::new(),
            origin_resolver: Arc::new(normalize_origin_url),
            limits: ConnectionLimits::default(),
            destination: None,
            fault: None,
            state: Mutex::new(BridgeState::default()),
            bridges: Arc::new(BridgeTracker::new()),
        }
    }

    pub fn with_limits(mut self, limits: ConnectionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_request_builder(mut self, builder: AccessRequestBuilder) -> Self {
        self.request_builder = builder;
        self
    }

    pub fn with_origin_resolver(mut self, resolver: OriginResolver) -> Self {
        self.origin_resolver = resolver;
        self
    }

    /// Jump destination sent as `Cf-Access-Jump-Destination`
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_fault_injection(mut self, fault: FaultInjection) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Number of local clients currently bridged
    pub fn active_connections(&self) -> usize {
        self.bridges.len()
    }

    fn inject(&self, step: FaultInjection) -> io::Result<()> {
        if self.fault == Some(step) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected {:?} failure", step),
            ));
        }
        Ok(())
    }

    fn bind_loopback(&self) -> Result<(TcpListener, u16), Failure> {
        let socket = self
            .inject(FaultInjection::Socket)
            .and_then(|_| TcpSocket::new_v4())
            .map_err(|e| {
                warn!("socket(): {}", e);
                Failure::transport("failed to create socket", true)
            })?;

        if let Err(e) = socket.set_reuseaddr(true) {
            debug!("SO_REUSEADDR not applied: {}", e);
        }

        let address: Ipv4Addr = self
            .inject(FaultInjection::InetPton)
            .ok()
            .and_then(|_| LOOPBACK.parse().ok())
            .ok_or_else(|| Failure::transport("failed to encode loopback address", false))?;

        self.inject(FaultInjection::Bind)
            .and_then(|_| socket.bind(SocketAddr::from((address, 0))))
            .map_err(|e| {
                warn!("bind(): {}", e);
                Failure::transport("failed to bind loopback listener", true)
            })?;

        let listener = self
            .inject(FaultInjection::Listen)
            .and_then(|_| socket.listen(LISTEN_BACKLOG))
            .map_err(|e| {
                warn!("listen(): {}", e);
                Failure::transport("failed to listen on loopback socket", true)
            })?;

        let port = self
            .inject(FaultInjection::Getsockname)
            .and_then(|_| listener.local_addr())
            .map_err(|e| {
                warn!("getsockname(): {}", e);
                Failure::transport("failed to read local listener port", false)
            })?
            .port();

        Ok((listener, port))
    }
}

#[async_trait]
impl TunnelProvider for TunnelBridge {
    async fn open(
        &self,
        hostname: &str,
        auth: &AuthContext,
        method: &AuthMethod,
    ) -> Result<u16, Failure> {
        let mut state = self.state.lock().await;
        if state.open {
            return Err(Failure::invalid_state("tunnel already open"));
        }

        let origin = (self.origin_resolver)(hostname)?;
        let ws_url = websocket_url(&origin)?;
        let request = self.request_builder.build(
            &ws_url,
            auth,
            self.destination.as_deref(),
            &[],
        );

        let (listener, port) = self.bind_loopback()?;

        let cancel = CancellationToken::new();
        let context = Arc::new(AcceptContext {
            dialer: self.dialer.clone(),
            request,
            limits: self.limits,
            bridges: self.bridges.clone(),
        });
        let handle = tokio::spawn(accept_loop(listener, context, cancel.clone()));

        state.listener = Some(ListenerTask { cancel, handle });
        state.open = true;

        info!(
            "🌐 Listening on {}:{} for {} ({})",
            LOOPBACK,
            port,
            ws_url,
            if method.is_service_token() { "service token" } else { "oauth" }
        );
        Ok(port)
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;

        if let Some(listener) = state.listener.take() {
            listener.cancel.cancel();
            if let Err(e) = listener.handle.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }

        let bridges = self.bridges.drain();
        for bridge in &bridges {
            bridge.cancel.cancel();
        }
        let count = bridges.len();
        for bridge in bridges {
            if let Err(e) = bridge.handle.await {
                warn!("Bridge task ended abnormally: {}", e);
            }
        }

        if state.open {
            info!("Tunnel closed ({} bridged connection(s) torn down)", count);
        }
        state.open = false;
    }
}

impl Drop for TunnelBridge {
    fn drop(&mut self) {
        if let Some(listener) = &self.state.get_mut().listener {
            listener.cancel.cancel();
        }
        self.bridges.cancel_all();
    }
}

async fn accept_loop(listener: TcpListener, context: Arc<AcceptContext>, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Accept loop cancelled");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Failed to accept local connection: {}", e);
                    break;
                }
            },
        };

        if context.bridges.len() >= context.limits.max_connections() {
            warn!("Connection limit reached, rejecting local client {}", peer);
            reject(stream).await;
            continue;
        }

        let dialer = context.dialer.clone();
        let request = context.request.clone();
        let bridge_id = context
            .bridges
            .spawn(move |id, cancel| run_bridge(id, stream, dialer, request, cancel));
        debug!(%bridge_id, "Accepted local client {}", peer);

        if context.limits.stop_accepting_after_first_connection {
            info!("Closing local listener after first client");
            break;
        }
    }
    // listener dropped here
}

/// Shut down and close a client refused by the connection limit
async fn reject(mut stream: TcpStream) {
    if let Err(e) = stream.shutdown().await {
        debug!("Shutdown of rejected client failed: {}", e);
    }
    drop(stream);
}

#[derive(Debug, Clone, Copy)]
enum Pump {
    ClientToWebSocket,
    WebSocketToClient,
}

async fn run_bridge(
    id: Uuid,
    mut stream: TcpStream,
    dialer: Arc<dyn WebSocketDialer>,
    request: AccessRequest,
    cancel: CancellationToken,
) {
    let dialed = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(bridge_id = %id, "Bridge cancelled while dialing");
            return;
        }
        dialed = dialer.connect(request) => dialed,
    };

    let ws = match dialed {
        Ok(ws) => ws,
        Err(e) => {
            warn!(bridge_id = %id, "WebSocket dial failed: {}", e);
            let _ = stream.shutdown().await;
            return;
        }
    };
    debug!(bridge_id = %id, "Bridge established");

    let (reader, writer) = stream.into_split();
    let pumps = cancel.child_token();

    let upstream = pump_client_to_websocket(id, reader, ws.as_ref(), pumps.clone());
    let downstream = pump_websocket_to_client(id, writer, ws.as_ref(), pumps.clone());
    tokio::pin!(upstream, downstream);

    let finished = tokio::select! {
        _ = &mut upstream => Pump::ClientToWebSocket,
        _ = &mut downstream => Pump::WebSocketToClient,
    };
    pumps.cancel();

    match finished {
        Pump::ClientToWebSocket => downstream.await,
        Pump::WebSocketToClient => upstream.await,
    }
    ws.close().await;

    debug!(bridge_id = %id, "Bridge finished ({:?} ended first)", finished);
}

async fn pump_client_to_websocket(
    id: Uuid,
    mut reader: OwnedReadHalf,
    ws: &dyn WebSocketClient,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buffer) => match read {
                Ok(0) => {
                    debug!(bridge_id = %id, "Local client closed");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(bridge_id = %id, "Local read failed: {}", e);
                    break;
                }
            },
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = ws.send(buffer[..n].to_vec()) => sent,
        };
        if let Err(e) = sent {
            debug!(bridge_id = %id, "WebSocket send failed: {}", e);
            break;
        }
    }
}

async fn pump_websocket_to_client(
    id: Uuid,
    mut writer: OwnedWriteHalf,
    ws: &dyn WebSocketClient,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            received = ws.receive() => match received {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    debug!(bridge_id = %id, "WebSocket closed by peer");
                    break;
                }
                Err(e) => {
                    debug!(bridge_id = %id, "WebSocket receive failed: {}", e);
                    break;
                }
            },
        };

        if payload.is_empty() {
            continue;
        }

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = writer.write_all(&payload) => written,
        };
        if let Err(e) = written {
            debug!(bridge_id = %id, "Local write failed: {}", e);
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(bridge_id = %id, "Local shutdown failed: {}", e);
    }
}
