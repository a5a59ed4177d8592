use crate::clienv;
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:10050";
pub const DEFAULT_TIMEOUT_SECS: u64 = 3;
pub const DEFAULT_REFRESH_ACTIVE_CHECKS_SECS: u64 = 120;
pub const DEFAULT_STATUS_PATH: &str = "/status";

const MAX_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Name reported to the server; defaults to the system hostname.
    pub hostname: String,
    /// Passive-check listen address.
    pub listen: SocketAddr,
    /// Peers allowed to request passive checks. Empty allows everyone.
    pub allowed_peers: Vec<IpAddr>,
    /// Server to fetch active checks from. Active checks are off when unset.
    pub server: Option<String>,
    /// Per-operation network and collection timeout.
    pub timeout_secs: u64,
    pub refresh_active_checks_secs: u64,
    pub control_socket: PathBuf,
    pub status: Option<StatusConfig>,
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusConfig {
    pub listen: SocketAddr,
    #[serde(default = "default_status_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    pub name: String,
    pub path: PathBuf,
}

fn default_status_path() -> String {
    DEFAULT_STATUS_PATH.to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: clienv::hostname(),
            listen: DEFAULT_LISTEN
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 10050))),
            allowed_peers: Vec::new(),
            server: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            refresh_active_checks_secs: DEFAULT_REFRESH_ACTIVE_CHECKS_SECS,
            control_socket: clienv::control_socket_path(),
            status: None,
            plugins: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading agent config");

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file does not exist, using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let content = fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| AgentError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| AgentError::Config(e.to_string()))?;
        config.validate()?;
        tracing::trace!(hostname = %config.hostname, listen = %config.listen, "Agent config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(AgentError::Config("hostname must not be empty".into()));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout_secs) {
            return Err(AgentError::Config(format!(
                "timeout_secs must be between 1 and {}, got {}",
                MAX_TIMEOUT_SECS, self.timeout_secs
            )));
        }
        if self.refresh_active_checks_secs == 0 {
            return Err(AgentError::Config(
                "refresh_active_checks_secs must be positive".into(),
            ));
        }
        if let Some(status) = &self.status {
            if !status.path.starts_with('/') {
                return Err(AgentError::Config(format!(
                    "status path must start with '/', got \"{}\"",
                    status.path
                )));
            }
        }
        for plugin in &self.plugins {
            if plugin.name.is_empty() || plugin.name.contains('/') {
                return Err(AgentError::Config(format!(
                    "invalid plugin name \"{}\"",
                    plugin.name
                )));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_active_checks(&self) -> Duration {
        Duration::from_secs(self.refresh_active_checks_secs)
    }

    pub fn is_peer_allowed(&self, peer: IpAddr) -> bool {
        peer_allowed(&self.allowed_peers, peer)
    }
}

/// An empty list allows every peer. IPv4-mapped IPv6 peers match their
/// IPv4 entry.
pub fn peer_allowed(allowed: &[IpAddr], peer: IpAddr) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let peer = match peer {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(peer),
        v4 => v4,
    };
    allowed.contains(&peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.listen.port(), 10050);
        assert_eq!(config.timeout(), Duration::from_secs(3));
        assert!(config.status.is_none());
    }

    #[test]
    fn test_full_toml() {
        let config = AgentConfig::from_toml(
            r#"
            hostname = "web-01"
            listen = "127.0.0.1:10050"
            allowed_peers = ["10.0.0.5", "127.0.0.1"]
            server = "10.0.0.5:10051"
            timeout_secs = 5
            control_socket = "/run/hostagent/control.sock"

            [status]
            listen = "127.0.0.1:8999"

            [[plugins]]
            name = "smart"
            path = "/usr/libexec/hostagent/smart"
            "#,
        )
        .unwrap();

        assert_eq!(config.hostname, "web-01");
        assert_eq!(config.server.as_deref(), Some("10.0.0.5:10051"));
        assert_eq!(config.status.unwrap().path, "/status");
        assert_eq!(config.plugins[0].name, "smart");
        assert_eq!(config.refresh_active_checks_secs, 120);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AgentConfig::from_toml("timeout_secs = 0").is_err());
        assert!(AgentConfig::from_toml("timeout_secs = 31").is_err());
        assert!(AgentConfig::from_toml("hostname = \"  \"").is_err());
        assert!(AgentConfig::from_toml("no_such_key = 1").is_err());
        assert!(AgentConfig::from_toml("[status]\nlisten = \"127.0.0.1:1\"\npath = \"x\"").is_err());
    }

    #[test]
    fn test_peer_access_list() {
        let mut config = AgentConfig::default();
        assert!(config.is_peer_allowed("192.0.2.1".parse().unwrap()));

        config.allowed_peers = vec!["127.0.0.1".parse().unwrap()];
        assert!(config.is_peer_allowed("127.0.0.1".parse().unwrap()));
        assert!(config.is_peer_allowed("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!config.is_peer_allowed("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(&dir.path().join("agent.toml")).unwrap();
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }
}
