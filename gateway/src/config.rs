//! Gateway configuration loaded from TOML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH server listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Path to the SSH host key
    pub host_key_path: PathBuf,

    /// OpenSSH authorized_keys file accepted for every upstream
    pub authorized_keys: Option<PathBuf>,

    /// Relay behaviour shared by all upstreams
    pub relay: RelayConfig,

    /// Upstream servers, keyed by the name clients put in their SSH username
    pub upstreams: BTreeMap<String, UpstreamConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("relay-gateway");

        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            host_key_path: data_dir.join("host_key"),
            authorized_keys: None,
            relay: RelayConfig::default(),
            upstreams: BTreeMap::new(),
        }
    }
}

/// What the dispatcher does after the upstream refuses a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenFailurePolicy {
    /// Reject the client's channel and stop accepting new channels.
    #[default]
    Terminate,
    /// Reject the client's channel and keep serving the session.
    Continue,
}

/// Relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Behaviour when the upstream refuses a channel open
    pub on_open_failure: OpenFailurePolicy,

    /// Seconds a channel may outlive its session's cancellation before both
    /// ends are closed. Unset: only warn.
    pub cancel_grace_secs: Option<u64>,

    /// Capacity of the per-channel and per-session request queues
    pub request_queue_depth: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            on_open_failure: OpenFailurePolicy::Terminate,
            cancel_grace_secs: None,
            request_queue_depth: 32,
        }
    }
}

impl RelayConfig {
    pub fn cancel_grace(&self) -> Option<Duration> {
        self.cancel_grace_secs.map(Duration::from_secs)
    }
}

/// One upstream SSH server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// "host:port" of the upstream server
    pub address: String,

    /// Remote user; defaults to the user part of the client's SSH username
    pub user: Option<String>,

    /// Private key the gateway authenticates with
    pub identity_file: PathBuf,

    /// Expected "SHA256:..." fingerprint of the upstream host key. Unset:
    /// any host key is accepted and logged.
    pub host_key_fingerprint: Option<String>,

    /// Extra OpenSSH public key lines allowed to use this upstream
    pub authorized_keys: Vec<String>,

    /// Variables sent as `env` requests before every shell or exec
    pub environment: BTreeMap<String, String>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the default configuration to `path`, which must not exist yet.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Err(anyhow!("Refusing to overwrite {}", path.display()));
        }
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Reject configurations the gateway cannot serve.
    pub fn validate(&self) -> Result<()> {
        if self.relay.request_queue_depth == 0 {
            return Err(anyhow!("relay.request_queue_depth must be at least 1"));
        }
        for (name, upstream) in &self.upstreams {
            if name.is_empty() || name.contains('+') {
                return Err(anyhow!("Invalid upstream name '{}'", name));
            }
            if upstream.address.is_empty() {
                return Err(anyhow!("Upstream '{}' has no address", name));
            }
        }
        Ok(())
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.host_key_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create host key directory: {}", parent.display()))?;
        }
        Ok(())
    }

    pub fn upstream(&self, name: &str) -> Option<&UpstreamConfig> {
        self.upstreams.get(name)
    }
}
