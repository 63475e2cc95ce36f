//! System browser login session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use access_ssh_auth::{Failure, OAuthWebSession};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Opens the authorize URL in the default browser. Ctrl-C while the login is
/// pending counts as a cancelled login.
#[derive(Default)]
pub struct BrowserWebSession {
    cancelled: Arc<AtomicBool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl BrowserWebSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn launcher(url: &str) -> Command {
        if cfg!(target_os = "macos") {
            let mut command = Command::new("open");
            command.arg(url);
            command
        } else if cfg!(target_os = "windows") {
            let mut command = Command::new("cmd");
            command.args(["/C", "start", "", url]);
            command
        } else {
            let mut command = Command::new("xdg-open");
            command.arg(url);
            command
        }
    }

    fn set_watcher(&self, handle: Option<JoinHandle<()>>) {
        let mut watcher = self
            .watcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = watcher.take() {
            previous.abort();
        }
        *watcher = handle;
    }
}

#[async_trait]
impl OAuthWebSession for BrowserWebSession {
    async fn start(&self, authorize_url: &Url) -> Result<(), Failure> {
        self.cancelled.store(false, Ordering::SeqCst);

        let cancelled = self.cancelled.clone();
        self.set_watcher(Some(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Login cancelled");
                cancelled.store(true, Ordering::SeqCst);
            }
        })));

        eprintln!("Opening your browser to log in to Cloudflare Access.");
        eprintln!("If it does not open, visit:\n\n  {}\n", authorize_url);

        match Self::launcher(authorize_url.as_str()).status().await {
            Ok(status) if status.success() => debug!("Browser launched"),
            Ok(status) => warn!("Browser launcher exited with {}", status),
            Err(e) => warn!("Failed to launch browser: {}", e),
        }
        Ok(())
    }

    async fn stop(&self) {
        self.set_watcher(None);
    }

    fn did_cancel_login(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for BrowserWebSession {
    fn drop(&mut self) {
        self.set_watcher(None);
    }
}
