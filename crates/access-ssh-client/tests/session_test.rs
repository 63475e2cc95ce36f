//! Session state machine tests with scripted auth and tunnel providers

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use access_ssh_auth::AuthProvider;
use access_ssh_client::state::StateStream;
use access_ssh_client::{
    AuthContext, AuthMethod, ConnectionState, Failure, RetryPolicy, Session, TunnelProvider,
};
use async_trait::async_trait;
use tokio::sync::Notify;

const HOST: &str = "ssh.example.com";
const PORT: u16 = 5222;

type AuthFn = dyn Fn(&AuthMethod) -> Result<AuthContext, Failure> + Send + Sync;

struct ScriptedAuth {
    respond: Box<AuthFn>,
    calls: Mutex<Vec<(String, AuthMethod)>>,
}

impl ScriptedAuth {
    fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&AuthMethod) -> Result<AuthContext, Failure> + Send + Sync + 'static,
    {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn accepting() -> Arc<Self> {
        Self::new(|_| Ok(AuthContext::app_token("aaa.bbb.ccc")))
    }

    fn calls(&self) -> Vec<(String, AuthMethod)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthProvider for ScriptedAuth {
    async fn authenticate(
        &self,
        hostname: &str,
        method: &AuthMethod,
    ) -> Result<AuthContext, Failure> {
        self.calls
            .lock()
            .unwrap()
            .push((hostname.to_string(), method.clone()));
        (self.respond)(method)
    }
}

#[derive(Default)]
struct ScriptedTunnel {
    results: Mutex<VecDeque<Result<u16, Failure>>>,
    opened_with: Mutex<Vec<(String, AuthMethod)>>,
    closes: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl ScriptedTunnel {
    fn new(results: Vec<Result<u16, Failure>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            ..Default::default()
        })
    }

    fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(VecDeque::from([Ok(PORT)])),
            gate: Some(gate),
            ..Default::default()
        })
    }

    fn opens(&self) -> usize {
        self.opened_with.lock().unwrap().len()
    }
}

#[async_trait]
impl TunnelProvider for ScriptedTunnel {
    async fn open(
        &self,
        hostname: &str,
        _auth: &AuthContext,
        method: &AuthMethod,
    ) -> Result<u16, Failure> {
        self.opened_with
            .lock()
            .unwrap()
            .push((hostname.to_string(), method.clone()));
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Failure::transport("no scripted result", false)))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn oauth_method() -> AuthMethod {
    AuthMethod::OAuth {
        team_domain: "team.cloudflareaccess.com".to_string(),
        app_domain: HOST.to_string(),
        callback_scheme: "accessssh".to_string(),
    }
}

fn service_method() -> AuthMethod {
    AuthMethod::ServiceToken {
        team_domain: "team.cloudflareaccess.com".to_string(),
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
    }
}

fn retryable() -> Failure {
    Failure::transport("websocket connect failed: connection refused", true)
}

/// Everything published so far
fn published(stream: StateStream) -> Vec<ConnectionState> {
    let mut rx = stream.into_inner();
    let mut states = Vec::new();
    while let Ok(state) = rx.try_recv() {
        states.push(state);
    }
    states
}

#[tokio::test]
async fn test_connect_publishes_happy_path() {
    let auth = ScriptedAuth::accepting();
    let tunnel = ScriptedTunnel::new(vec![Ok(PORT)]);
    let session = Session::new(auth.clone(), tunnel.clone());
    let states = session.subscribe();

    let port = session.connect(&format!("  {}  ", HOST), oauth_method()).await.unwrap();

    assert_eq!(port, PORT);
    assert_eq!(
        published(states),
        vec![
            ConnectionState::Idle,
            ConnectionState::Authenticating,
            ConnectionState::Connecting,
            ConnectionState::Connected { local_port: PORT },
        ]
    );
    assert_eq!(auth.calls()[0].0, HOST);
    assert_eq!(tunnel.opened_with.lock().unwrap()[0].0, HOST);
}

#[tokio::test]
async fn test_late_subscriber_sees_current_state() {
    let session = Session::new(ScriptedAuth::accepting(), ScriptedTunnel::new(vec![Ok(PORT)]));
    session.connect(HOST, oauth_method()).await.unwrap();

    let states = session.subscribe();
    assert_eq!(published(states), vec![ConnectionState::Connected { local_port: PORT }]);
    assert_eq!(session.state(), ConnectionState::Connected { local_port: PORT });
}

#[tokio::test]
async fn test_service_token_falls_back_to_oauth() {
    let auth = ScriptedAuth::new(|method| match method {
        AuthMethod::ServiceToken { .. } => Err(Failure::auth("service token rejected")),
        AuthMethod::OAuth { .. } => Ok(AuthContext::app_token("aaa.bbb.ccc")),
    });
    let tunnel = ScriptedTunnel::new(vec![Ok(PORT)]);
    let session = Session::new(auth.clone(), tunnel.clone())
        .with_oauth_fallback(Arc::new(|_: &str| Some(oauth_method())));
    let states = session.subscribe();

    let port = session.connect(HOST, service_method()).await.unwrap();

    assert_eq!(port, PORT);
    assert_eq!(
        published(states),
        vec![
            ConnectionState::Idle,
            ConnectionState::Authenticating,
            ConnectionState::Authenticating,
            ConnectionState::Connecting,
            ConnectionState::Connected { local_port: PORT },
        ]
    );
    let calls = auth.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].1.is_service_token());
    assert_eq!(calls[1].1, oauth_method());
    assert_eq!(tunnel.opened_with.lock().unwrap()[0].1, oauth_method());
}

#[tokio::test]
async fn test_service_token_open_failure_falls_back_to_oauth() {
    let rejected = Failure::transport("websocket rejected", false);
    let auth = ScriptedAuth::accepting();
    let tunnel = ScriptedTunnel::new(vec![Err(rejected), Ok(PORT)]);
    let session = Session::new(auth.clone(), tunnel.clone())
        .with_oauth_fallback(Arc::new(|_: &str| Some(oauth_method())));
    let states = session.subscribe();

    assert_eq!(session.connect(HOST, service_method()).await, Ok(PORT));

    assert_eq!(
        published(states),
        vec![
            ConnectionState::Idle,
            ConnectionState::Authenticating,
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Connecting,
            ConnectionState::Connected { local_port: PORT },
        ]
    );
    let calls = auth.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].1.is_service_token());
    assert_eq!(calls[1].1, oauth_method());
    let opened = tunnel.opened_with.lock().unwrap().clone();
    assert!(opened[0].1.is_service_token());
    assert_eq!(opened[1].1, oauth_method());
}

#[tokio::test]
async fn test_oauth_fallback_runs_only_once() {
    let tunnel = ScriptedTunnel::new(vec![
        Err(Failure::transport("websocket rejected", false)),
        Err(Failure::transport("websocket rejected again", false)),
        Ok(PORT),
    ]);
    let session = Session::new(ScriptedAuth::accepting(), tunnel.clone())
        .with_oauth_fallback(Arc::new(|_: &str| Some(oauth_method())));

    let err = session.connect(HOST, service_method()).await.unwrap_err();

    assert_eq!(err, Failure::transport("websocket rejected again", false));
    assert_eq!(session.state(), ConnectionState::Failed(err));
    assert_eq!(tunnel.opens(), 2);
}

#[tokio::test]
async fn test_oauth_open_failure_does_not_fall_back() {
    let tunnel = ScriptedTunnel::new(vec![
        Err(Failure::transport("websocket rejected", false)),
        Ok(PORT),
    ]);
    let auth = ScriptedAuth::accepting();
    let session = Session::new(auth.clone(), tunnel.clone())
        .with_oauth_fallback(Arc::new(|_: &str| Some(oauth_method())));

    assert!(session.connect(HOST, oauth_method()).await.is_err());
    assert_eq!(auth.calls().len(), 1);
    assert_eq!(tunnel.opens(), 1);
}

#[tokio::test]
async fn test_providers_receive_canonical_host() {
    for input in ["https://SSH.example.com/", "ssh.example.com:22", "http://ssh.example.com/x"] {
        let auth = ScriptedAuth::accepting();
        let tunnel = ScriptedTunnel::new(vec![Ok(PORT)]);
        let session = Session::new(auth.clone(), tunnel.clone());

        assert_eq!(session.connect(input, oauth_method()).await, Ok(PORT));
        assert_eq!(auth.calls()[0].0, HOST, "{}", input);
        assert_eq!(tunnel.opened_with.lock().unwrap()[0].0, HOST, "{}", input);
    }
}

#[tokio::test]
async fn test_fallback_resolver_receives_canonical_host() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let resolver = {
        let seen = seen.clone();
        move |host: &str| {
            seen.lock().unwrap().push(host.to_string());
            Some(oauth_method())
        }
    };
    let auth = ScriptedAuth::new(|method| match method {
        AuthMethod::ServiceToken { .. } => Err(Failure::auth("service token rejected")),
        AuthMethod::OAuth { .. } => Ok(AuthContext::app_token("aaa.bbb.ccc")),
    });
    let session = Session::new(auth, ScriptedTunnel::new(vec![Ok(PORT)]))
        .with_oauth_fallback(Arc::new(resolver));

    assert_eq!(
        session.connect("https://SSH.example.com:443/", service_method()).await,
        Ok(PORT)
    );
    assert_eq!(*seen.lock().unwrap(), vec![HOST.to_string()]);
}

#[tokio::test]
async fn test_service_token_failure_without_fallback_fails() {
    let auth = ScriptedAuth::new(|_| Err(Failure::auth("service token rejected")));
    let tunnel = ScriptedTunnel::new(vec![Ok(PORT)]);
    let session = Session::new(auth.clone(), tunnel.clone());
    let states = session.subscribe();

    let err = session.connect(HOST, service_method()).await.unwrap_err();

    assert_eq!(err, Failure::auth("service token rejected"));
    assert_eq!(
        published(states),
        vec![
            ConnectionState::Idle,
            ConnectionState::Authenticating,
            ConnectionState::Failed(err),
        ]
    );
    assert_eq!(tunnel.opens(), 0);
}

#[tokio::test]
async fn test_fallback_failure_is_reported() {
    let auth = ScriptedAuth::new(|method| match method {
        AuthMethod::ServiceToken { .. } => Err(Failure::auth("service token rejected")),
        AuthMethod::OAuth { .. } => Err(Failure::auth("Cloudflare login was cancelled")),
    });
    let session = Session::new(auth.clone(), ScriptedTunnel::new(vec![]))
        .with_oauth_fallback(Arc::new(|_: &str| Some(oauth_method())));

    let err = session.connect(HOST, service_method()).await.unwrap_err();
    assert_eq!(err, Failure::auth("Cloudflare login was cancelled"));
    assert_eq!(session.state(), ConnectionState::Failed(err));
    assert_eq!(auth.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_reconnect_then_succeed() {
    let tunnel = ScriptedTunnel::new(vec![Err(retryable()), Err(retryable()), Ok(PORT)]);
    let session = Session::new(ScriptedAuth::accepting(), tunnel.clone())
        .with_retry_policy(RetryPolicy::new(2, Duration::from_millis(100)));
    let states = session.subscribe();

    let port = session.connect(HOST, oauth_method()).await.unwrap();

    assert_eq!(port, PORT);
    assert_eq!(
        published(states),
        vec![
            ConnectionState::Idle,
            ConnectionState::Authenticating,
            ConnectionState::Connecting,
            ConnectionState::Reconnecting { attempt: 1 },
            ConnectionState::Connecting,
            ConnectionState::Reconnecting { attempt: 2 },
            ConnectionState::Connecting,
            ConnectionState::Connected { local_port: PORT },
        ]
    );
    assert_eq!(tunnel.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_delay_is_linear() {
    let tunnel = ScriptedTunnel::new(vec![Err(retryable()), Err(retryable()), Ok(PORT)]);
    let session = Session::new(ScriptedAuth::accepting(), tunnel)
        .with_retry_policy(RetryPolicy::new(2, Duration::from_millis(100)));

    let started = tokio::time::Instant::now();
    session.connect(HOST, oauth_method()).await.unwrap();
    let elapsed = started.elapsed();

    // 100ms before attempt 1, 200ms before attempt 2
    assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400), "{:?}", elapsed);
}

#[tokio::test]
async fn test_non_retryable_failure_fails_immediately() {
    let fatal = Failure::transport("failed to read local listener port", false);
    let tunnel = ScriptedTunnel::new(vec![Err(fatal.clone()), Ok(PORT)]);
    let session = Session::new(ScriptedAuth::accepting(), tunnel.clone())
        .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1)));
    let states = session.subscribe();

    assert_eq!(session.connect(HOST, oauth_method()).await, Err(fatal.clone()));
    assert_eq!(
        published(states),
        vec![
            ConnectionState::Idle,
            ConnectionState::Authenticating,
            ConnectionState::Connecting,
            ConnectionState::Failed(fatal),
        ]
    );
    assert_eq!(tunnel.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_return_last_failure() {
    let last = Failure::transport("websocket connect failed: timed out", true);
    let tunnel = ScriptedTunnel::new(vec![Err(retryable()), Err(last.clone()), Ok(PORT)]);
    let session = Session::new(ScriptedAuth::accepting(), tunnel.clone())
        .with_retry_policy(RetryPolicy::new(1, Duration::from_millis(50)));

    assert_eq!(session.connect(HOST, oauth_method()).await, Err(last.clone()));
    assert_eq!(session.state(), ConnectionState::Failed(last));
    assert_eq!(tunnel.opens(), 2);
}

#[tokio::test]
async fn test_connect_while_busy_is_invalid_state() {
    let gate = Arc::new(Notify::new());
    let tunnel = ScriptedTunnel::gated(gate.clone());
    let session = Arc::new(Session::new(ScriptedAuth::accepting(), tunnel.clone()));

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(HOST, oauth_method()).await })
    };

    for _ in 0..500 {
        if tunnel.opens() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(session.state(), ConnectionState::Connecting);

    let err = session.connect(HOST, oauth_method()).await.unwrap_err();
    assert!(matches!(err, Failure::InvalidState(_)), "{:?}", err);
    assert_eq!(session.state(), ConnectionState::Failed(err));
    assert_eq!(tunnel.opens(), 1);

    gate.notify_one();
    assert_eq!(first.await.unwrap(), Ok(PORT));
}

#[tokio::test]
async fn test_blank_hostname_is_configuration_failure() {
    let auth = ScriptedAuth::accepting();
    let session = Session::new(auth.clone(), ScriptedTunnel::new(vec![Ok(PORT)]));
    let states = session.subscribe();

    let err = session.connect("   ", oauth_method()).await.unwrap_err();

    assert_eq!(err, Failure::configuration("hostname must not be empty"));
    assert_eq!(
        published(states),
        vec![ConnectionState::Idle, ConnectionState::Failed(err)]
    );
    assert!(auth.calls().is_empty());
}

#[tokio::test]
async fn test_disconnect_and_reconnect() {
    let tunnel = ScriptedTunnel::new(vec![Ok(PORT), Ok(PORT + 1)]);
    let session = Session::new(ScriptedAuth::accepting(), tunnel.clone());

    session.connect(HOST, oauth_method()).await.unwrap();
    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(tunnel.closes.load(Ordering::SeqCst), 1);

    // idempotent
    session.disconnect().await;
    assert_eq!(tunnel.closes.load(Ordering::SeqCst), 2);

    assert_eq!(session.connect(HOST, oauth_method()).await, Ok(PORT + 1));
}

#[tokio::test]
async fn test_failed_session_can_connect_again() {
    let tunnel = ScriptedTunnel::new(vec![
        Err(Failure::transport("failed to encode loopback address", false)),
        Ok(PORT),
    ]);
    let session = Session::new(ScriptedAuth::accepting(), tunnel);

    assert!(session.connect(HOST, oauth_method()).await.is_err());
    assert_eq!(session.connect(HOST, oauth_method()).await, Ok(PORT));
}
