//! Broker configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the broker daemon and CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Private key used to authenticate against every node
    pub ssh_key_path: PathBuf,

    /// known_hosts file consulted (and extended) during host key checks
    pub known_hosts_path: PathBuf,

    /// TOML file holding the managed nodes
    pub nodes_path: PathBuf,

    /// How unknown host keys are treated
    pub host_key_policy: HostKeyPolicy,

    /// SSH dial and handshake timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Delay between tunnel liveness checks
    #[serde(with = "duration_secs")]
    pub health_interval: Duration,

    /// How the local end of each tunnel picks its port
    pub port_allocation: PortAllocation,

    /// Backoff for nodes that fail to connect
    pub backoff: BackoffConfig,

    /// Panel client settings
    pub panel: PanelConfig,

    /// Key issuance settings
    pub issuance: IssuanceConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();
        let ssh_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ssh");

        Self {
            ssh_key_path: ssh_dir.join("id_ed25519"),
            known_hosts_path: config_dir.join("known_hosts"),
            nodes_path: config_dir.join("nodes.toml"),
            host_key_policy: HostKeyPolicy::default(),
            connect_timeout: Duration::from_secs(15),
            port_allocation: PortAllocation::default(),
            health_interval: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            panel: PanelConfig::default(),
            issuance: IssuanceConfig::default(),
        }
    }
}

/// Host key verification policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Only keys already present in known_hosts are accepted
    Strict,
    /// Unknown keys are recorded and accepted; changed keys are rejected
    #[default]
    TrustOnFirstUse,
}

/// Local port selection for tunnel listeners
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum PortAllocation {
    /// Let the OS choose a free port
    #[default]
    Ephemeral,
    /// Take the first bindable port at or above `start`
    Sequential {
        #[serde(default = "default_port_start")]
        start: u16,
    },
}

fn default_port_start() -> u16 {
    10000
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

/// Scheme used to reach a panel through its tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelScheme {
    /// Try HTTPS, fall back to HTTP if the panel does not speak TLS
    #[default]
    Auto,
    Https,
    Http,
}

impl std::str::FromStr for PanelScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(PanelScheme::Auto),
            "https" => Ok(PanelScheme::Https),
            "http" => Ok(PanelScheme::Http),
            other => Err(format!("unknown panel scheme '{}'", other)),
        }
    }
}

/// Panel client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub scheme: PanelScheme,

    /// Per-request timeout
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Panel session lifetime
    #[serde(with = "duration_secs")]
    pub session_ttl: Duration,

    /// Re-login this long before the session expires
    #[serde(with = "duration_secs")]
    pub refresh_margin: Duration,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            scheme: PanelScheme::Auto,
            request_timeout: Duration::from_secs(10),
            session_ttl: Duration::from_secs(3600),
            refresh_margin: Duration::from_secs(300),
        }
    }
}

impl PanelConfig {
    /// Client options for `xk_panel::PanelClient`
    pub fn client_options(&self) -> xk_panel::ClientOptions {
        xk_panel::ClientOptions {
            request_timeout: self.request_timeout,
            session_ttl: self.session_ttl,
            refresh_margin: self.refresh_margin,
            accept_invalid_certs: true,
        }
    }
}

/// Key issuance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuanceConfig {
    /// Attempts at resolving the primary inbound
    pub attempts: u32,

    /// Sleep after failed attempt `n` is `n * retry_step`
    #[serde(with = "duration_secs")]
    pub retry_step: Duration,

    /// Remark of inbounds created by provisioning
    pub inbound_remark: String,

    /// Public port of inbounds created by provisioning
    pub inbound_port: u16,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_step: Duration::from_secs(2),
            inbound_remark: "DefaultInbound".to_string(),
            inbound_port: 443,
        }
    }
}
