//! access-ssh CLI - SSH through Cloudflare Access
//!
//! Opens a loopback port whose connections are tunnelled over an
//! Access-authorized WebSocket, for use as an SSH `ProxyCommand` target or a
//! plain `ssh -p <port> 127.0.0.1`.

mod browser;
mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use access_ssh_auth::{
    oauth_cache_key, AuthMultiplexer, AuthProvider, FileTokenStore, OAuthProvider,
    ReqwestHttpClient, ServiceTokenProvider, TokenStore, TransferOAuthFlow,
};
use access_ssh_client::{ConnectionLimits, ConnectionState, RetryPolicy};
use access_ssh_proto::{normalize_host, AuthMethod};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::browser::BrowserWebSession;
use crate::config::{AccessSshConfig, ConfigManager};

const CALLBACK_SCHEME: &str = "access-ssh";

/// access-ssh - SSH to Cloudflare Access protected hosts
#[derive(Parser, Debug)]
#[command(name = "access-ssh")]
#[command(about = "SSH to Cloudflare Access protected hosts through a local tunnel")]
#[command(version = long_version())]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.access-ssh/config.json)
    #[arg(long, global = true, env = "ACCESS_SSH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Target {
    /// Access protected hostname (e.g. ssh.example.com)
    #[arg(long, env = "ACCESS_SSH_HOSTNAME")]
    hostname: String,

    /// Access team domain (e.g. myteam.cloudflareaccess.com)
    #[arg(long, env = "ACCESS_SSH_TEAM_DOMAIN")]
    team_domain: Option<String>,

    /// Application domain (defaults to the hostname)
    #[arg(long, env = "ACCESS_SSH_APP_DOMAIN")]
    app_domain: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a local tunnel to an Access protected SSH host
    #[command(long_about = r#"
Authenticate with Cloudflare Access and listen on 127.0.0.1. Connections to
the printed port are forwarded over an Access WebSocket until Ctrl-C.

EXAMPLES:
  # Interactive browser login
  access-ssh connect --hostname ssh.example.com \
    --team-domain myteam.cloudflareaccess.com

  # Service token, falling back to browser login if it is rejected
  access-ssh connect --hostname ssh.example.com \
    --team-domain myteam.cloudflareaccess.com \
    --client-id $ID --client-secret $SECRET

ENVIRONMENT VARIABLES:
  ACCESS_SSH_HOSTNAME       Access protected hostname
  ACCESS_SSH_TEAM_DOMAIN    Access team domain
  ACCESS_SSH_APP_DOMAIN     Application domain
  ACCESS_SSH_CLIENT_ID      Service token client id
  ACCESS_SSH_CLIENT_SECRET  Service token client secret
  ACCESS_SSH_DESTINATION    Jump destination (host:port)
    "#)]
    Connect {
        #[command(flatten)]
        target: Target,

        /// Service token client id
        #[arg(long, env = "ACCESS_SSH_CLIENT_ID", requires = "client_secret")]
        client_id: Option<String>,

        /// Service token client secret
        #[arg(long, env = "ACCESS_SSH_CLIENT_SECRET", hide_env_values = true)]
        client_secret: Option<String>,

        /// Jump destination for infrastructure targets (host:port)
        #[arg(long, env = "ACCESS_SSH_DESTINATION")]
        destination: Option<String>,

        /// Reconnect attempts after a retryable failure
        #[arg(long)]
        max_reconnect_attempts: Option<u32>,

        /// Base reconnect delay in milliseconds
        #[arg(long)]
        reconnect_delay_ms: Option<u64>,

        /// Concurrent local connections allowed
        #[arg(long)]
        max_connections: Option<usize>,

        /// Keep accepting local connections after the first one
        #[arg(long)]
        keep_listening: bool,
    },

    /// Log in through the browser and cache the Access token
    Login {
        #[command(flatten)]
        target: Target,
    },

    /// Remove the cached Access token for a host
    Logout {
        #[command(flatten)]
        target: Target,
    },
}

fn long_version() -> &'static str {
    concat!(
        env!("GIT_TAG"),
        " (",
        env!("GIT_HASH"),
        ", built ",
        env!("BUILD_TIME"),
        ")"
    )
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Team and app domain for a target, from flags first, then the config file
fn resolve_domains(target: &Target, config: &AccessSshConfig) -> Result<(String, String)> {
    let team_domain = target
        .team_domain
        .clone()
        .or_else(|| config.team_domain.clone())
        .filter(|d| !d.trim().is_empty())
        .context("Access team domain is required (--team-domain or ACCESS_SSH_TEAM_DOMAIN)")?;
    let app_domain = match target
        .app_domain
        .clone()
        .or_else(|| config.app_domain.clone())
        .filter(|d| !d.trim().is_empty())
    {
        Some(app_domain) => app_domain,
        None => access_host(target)?,
    };
    Ok((team_domain, app_domain))
}

/// Canonical host for a target, the key the token cache is indexed by
fn access_host(target: &Target) -> Result<String> {
    normalize_host(&target.hostname)
        .with_context(|| format!("Invalid hostname {:?}", target.hostname))
}

fn token_store(config: &AccessSshConfig) -> Result<Arc<FileTokenStore>> {
    let path = match &config.token_store {
        Some(path) => path.clone(),
        None => FileTokenStore::default_path().context("Failed to locate token store")?,
    };
    Ok(Arc::new(FileTokenStore::new(path)))
}

fn oauth_provider(config: &AccessSshConfig, store: Arc<FileTokenStore>) -> Result<OAuthProvider> {
    let client = ReqwestHttpClient::new().context("Failed to create HTTP client")?;
    let flow = TransferOAuthFlow::new(Arc::new(BrowserWebSession::new()), Arc::new(client))
        .context("Failed to create login flow")?
        .with_settings(config.transfer.clone());
    Ok(OAuthProvider::new(Arc::new(flow), store))
}

#[allow(clippy::too_many_arguments)]
async fn run_connect(
    manager: &ConfigManager,
    target: Target,
    client_id: Option<String>,
    client_secret: Option<String>,
    destination: Option<String>,
    max_reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    max_connections: Option<usize>,
    keep_listening: bool,
) -> Result<()> {
    let mut config = manager.load()?;
    let (team_domain, app_domain) = resolve_domains(&target, &config)?;

    if let Some(destination) = destination {
        config.session.destination = Some(destination);
    }
    if max_reconnect_attempts.is_some() || reconnect_delay_ms.is_some() {
        config.session.retry = RetryPolicy::new(
            max_reconnect_attempts.unwrap_or(config.session.retry.max_reconnect_attempts),
            reconnect_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(config.session.retry.base_delay),
        );
    }
    if max_connections.is_some() || keep_listening {
        config.session.limits = ConnectionLimits::new(
            max_connections.unwrap_or(config.session.limits.max_concurrent_connections),
            !keep_listening,
        );
    }

    let oauth_method = AuthMethod::OAuth {
        team_domain: team_domain.clone(),
        app_domain: app_domain.clone(),
        callback_scheme: CALLBACK_SCHEME.to_string(),
    };
    let method = match (client_id, client_secret) {
        (Some(client_id), Some(client_secret)) => AuthMethod::ServiceToken {
            team_domain: team_domain.clone(),
            client_id,
            client_secret,
        },
        (None, None) => oauth_method.clone(),
        _ => bail!("--client-id and --client-secret must be given together"),
    };

    let store = token_store(&config)?;
    let auth = AuthMultiplexer::new(
        Arc::new(oauth_provider(&config, store)?),
        Arc::new(ServiceTokenProvider::new()),
    );
    let bridge = Arc::new(config.session.tunnel_bridge());
    let session = config
        .session
        .session(Arc::new(auth), bridge)
        .with_oauth_fallback(Arc::new(move |_: &str| Some(oauth_method.clone())));

    let mut states = session.subscribe();
    let reporter = tokio::spawn(async move {
        while let Some(state) = states.next().await {
            match &state {
                ConnectionState::Failed(failure) => warn!("State: failed ({})", failure),
                other => info!("State: {}", other),
            }
        }
    });

    let port = session
        .connect(&target.hostname, method)
        .await
        .context(format!("Failed to connect to {}", target.hostname))?;

    println!("127.0.0.1:{}", port);
    println!("Press Ctrl-C to disconnect");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    session.disconnect().await;
    drop(session);
    reporter.abort();
    Ok(())
}

async fn run_login(manager: &ConfigManager, target: Target) -> Result<()> {
    let config = manager.load()?;
    let (team_domain, app_domain) = resolve_domains(&target, &config)?;
    let store = token_store(&config)?;
    let provider = oauth_provider(&config, store.clone())?;

    let method = AuthMethod::OAuth {
        team_domain: team_domain.clone(),
        app_domain: app_domain.clone(),
        callback_scheme: CALLBACK_SCHEME.to_string(),
    };
    let host = access_host(&target)?;
    provider
        .authenticate(&host, &method)
        .await
        .context("Login failed")?;

    manager.remember_domains(&team_domain, &app_domain)?;
    println!("✅ Logged in to {}", host);
    println!("   Token cached in {}", store.path().display());
    Ok(())
}

async fn run_logout(manager: &ConfigManager, target: Target) -> Result<()> {
    let config = manager.load()?;
    let (team_domain, app_domain) = resolve_domains(&target, &config)?;
    let store = token_store(&config)?;

    let host = access_host(&target)?;
    let key = oauth_cache_key(&team_domain, &app_domain, &host);
    store
        .remove_token(&key)
        .await
        .context("Failed to remove cached token")?;
    println!("Logged out of {}", host);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let manager = match cli.config {
        Some(path) => ConfigManager::new(path),
        None => ConfigManager::default_location()?,
    };
    info!("Using config {}", manager.path().display());

    match cli.command {
        Commands::Connect {
            target,
            client_id,
            client_secret,
            destination,
            max_reconnect_attempts,
            reconnect_delay_ms,
            max_connections,
            keep_listening,
        } => {
            run_connect(
                &manager,
                target,
                client_id,
                client_secret,
                destination,
                max_reconnect_attempts,
                reconnect_delay_ms,
                max_connections,
                keep_listening,
            )
            .await
        }
        Commands::Login { target } => run_login(&manager, target).await,
        Commands::Logout { target } => run_logout(&manager, target).await,
    }
}
