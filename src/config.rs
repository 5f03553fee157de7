use crate::clienv;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SYSFS_ROOT: &str = "/sys";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket clients connect to
    pub socket_path: PathBuf,
    /// Single-instance marker
    pub pid_path: PathBuf,
    /// Log file used when running detached
    pub log_path: PathBuf,
    /// Group owning the socket; unset leaves the group alone
    pub socket_group: Option<String>,
    pub recv_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Where PMUs and the online CPU list are discovered
    pub sysfs_root: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(clienv::DEFAULT_SOCKET_PATH),
            pid_path: PathBuf::from(clienv::DEFAULT_PID_PATH),
            log_path: PathBuf::from(clienv::DEFAULT_LOG_PATH),
            socket_group: Some(clienv::DEFAULT_SOCKET_GROUP.to_string()),
            recv_timeout_ms: DEFAULT_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_TIMEOUT_MS,
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
        }
    }
}

impl DaemonConfig {
    /// Defaults, then the config file if present, then env overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_file(&clienv::config_path())?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse `path`; a missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading daemon config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(socket = %config.socket_path.display(), group = ?config.socket_group, "Daemon config loaded");
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Some(path) = clienv::socket_path() {
            self.socket_path = path;
        }
        if let Some(path) = clienv::pid_path() {
            self.pid_path = path;
        }
        if let Some(path) = clienv::log_path() {
            self.log_path = path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.socket_path.as_os_str().is_empty() {
            anyhow::bail!("socket_path must not be empty");
        }
        if self.pid_path.as_os_str().is_empty() {
            anyhow::bail!("pid_path must not be empty");
        }
        if self.recv_timeout_ms == 0 || self.send_timeout_ms == 0 {
            anyhow::bail!("socket timeouts must be nonzero");
        }
        Ok(())
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}
