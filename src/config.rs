//! Global CLI configuration management
//!
//! Stores the default team/app domains and tunnel tuning in
//! ~/.access-ssh/config.json

use access_ssh_auth::TransferSettings;
use access_ssh_client::SessionConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Global CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSshConfig {
    /// Default Access team domain (e.g. myteam.cloudflareaccess.com)
    pub team_domain: Option<String>,
    /// Default application domain
    pub app_domain: Option<String>,
    /// Where cached Access tokens live; defaults next to this file
    pub token_store: Option<PathBuf>,
    pub session: SessionConfig,
    pub transfer: TransferSettings,
}

/// Configuration manager
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Manager for ~/.access-ssh/config.json
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(Self::new(home.join(".access-ssh").join("config.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration from disk
    pub fn load(&self) -> Result<AccessSshConfig> {
        // Return default config if file doesn't exist
        if !self.path.exists() {
            return Ok(AccessSshConfig::default());
        }

        let json = fs::read_to_string(&self.path)
            .context(format!("Failed to read config file: {:?}", self.path))?;

        let config: AccessSshConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", self.path))?;

        Ok(config)
    }

    /// Save the configuration to disk
    pub fn save(&self, config: &AccessSshConfig) -> Result<()> {
        // Ensure directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(&self.path, json)
            .context(format!("Failed to write config file: {:?}", self.path))?;

        Ok(())
    }

    /// Remember the team and app domains used for a successful login
    pub fn remember_domains(&self, team_domain: &str, app_domain: &str) -> Result<()> {
        let mut config = self.load()?;
        config.team_domain = Some(team_domain.to_string());
        config.app_domain = Some(app_domain.to_string());
        self.save(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().join("config.json"));

        let config = manager.load().unwrap();
        assert_eq!(config, AccessSshConfig::default());
        assert_eq!(config.transfer.poll_attempts, 14);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().join("nested").join("config.json"));

        let mut config = AccessSshConfig::default();
        config.session.retry.max_reconnect_attempts = 3;
        config.transfer.poll_delay = Duration::from_millis(500);
        manager.save(&config).unwrap();
        manager
            .remember_domains("team.cloudflareaccess.com", "ssh.example.com")
            .unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded.team_domain.as_deref(), Some("team.cloudflareaccess.com"));
        assert_eq!(loaded.app_domain.as_deref(), Some("ssh.example.com"));
        assert_eq!(loaded.session.retry.max_reconnect_attempts, 3);
        assert_eq!(loaded.transfer.poll_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"team_domain":"team.cloudflareaccess.com"}"#).unwrap();

        let config = ConfigManager::new(&path).load().unwrap();
        assert_eq!(config.team_domain.as_deref(), Some("team.cloudflareaccess.com"));
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();

        assert!(ConfigManager::new(&path).load().is_err());
    }
}
