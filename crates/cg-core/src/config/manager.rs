//! Manager daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the cluster manager daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Address the HTTP listener binds to
    pub bind_address: String,

    /// Address sibling replicas reach us at; also our identity in discovery
    pub advertise_address: Option<String>,

    /// Path of the tunnel registration endpoint
    pub register_path: String,

    /// Prefix in front of `/clusters/{id}` for the k8s proxy
    pub k8s_prefix: String,

    /// Prefix of the mesos proxy routes
    pub mesos_prefix: String,

    /// Per-attempt timeout for dialing through a tunnel
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,

    /// Largest request body the mesos proxy buffers
    pub max_request_body: usize,

    /// Tunnel heartbeat settings
    pub heartbeat: HeartbeatConfig,

    /// Replica-to-replica link settings
    pub peer: PeerConfig,

    /// How sibling replicas are discovered
    pub discovery: DiscoveryConfig,

    /// Credential persistence
    pub store: StoreConfig,

    /// Reconnect backoff for peer links
    pub backoff: BackoffConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            advertise_address: None,
            register_path: "/tunnels/register".to_string(),
            k8s_prefix: String::new(),
            mesos_prefix: "/mesosdriver/v4".to_string(),
            dial_timeout: Duration::from_secs(15),
            max_request_body: 10 * 1024 * 1024,
            heartbeat: HeartbeatConfig::default(),
            peer: PeerConfig::default(),
            discovery: DiscoveryConfig::default(),
            store: StoreConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Address this replica is known by.
    ///
    /// Falls back to the bind address, with an unspecified host replaced by
    /// the machine's hostname.
    pub fn self_address(&self) -> String {
        if let Some(addr) = self.advertise_address.as_deref().filter(|a| !a.is_empty()) {
            return addr.to_string();
        }
        match self.bind_address.rsplit_once(':') {
            Some((host, port)) if host == "0.0.0.0" || host == "[::]" || host.is_empty() => {
                let hostname = gethostname::gethostname().to_string_lossy().into_owned();
                format!("{}:{}", hostname, port)
            }
            _ => self.bind_address.clone(),
        }
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.register_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "register_path must start with '/': {}",
                self.register_path
            )));
        }
        if !self.mesos_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "mesos_prefix must start with '/': {}",
                self.mesos_prefix
            )));
        }
        if !self.k8s_prefix.is_empty() && !self.k8s_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "k8s_prefix must be empty or start with '/': {}",
                self.k8s_prefix
            )));
        }
        if self.heartbeat.timeout <= self.heartbeat.interval {
            return Err(ConfigError::Invalid(
                "heartbeat.timeout must exceed heartbeat.interval".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::Invalid(format!(
                "backoff.jitter must be within 0.0..=1.0, got {}",
                self.backoff.jitter
            )));
        }
        if self.peer.use_tls && self.peer.ca_file.is_none() {
            return Err(ConfigError::Invalid(
                "peer.use_tls requires peer.ca_file".to_string(),
            ));
        }
        if self.discovery.mode == DiscoveryMode::Dns && self.discovery.dns_name.is_none() {
            return Err(ConfigError::Invalid(
                "discovery.mode = \"dns\" requires discovery.dns_name".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tunnel heartbeat settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between pings
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// Silence after which a session is considered dead
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

/// Replica-to-replica link settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Shared secret peers present in `X-API-Tunnel-Token`
    pub token: String,

    /// Dial peers over https
    pub use_tls: bool,

    /// CA bundle used to verify peers when `use_tls` is set
    pub ca_file: Option<PathBuf>,
}

/// Discovery backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Fixed member list
    #[default]
    Static,
    /// Periodic DNS resolution
    Dns,
}

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Backend
    pub mode: DiscoveryMode,

    /// Members for static mode, as `host:port`
    pub members: Vec<String>,

    /// `host:port` resolved in dns mode
    pub dns_name: Option<String>,

    /// How often dns mode re-resolves
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::Static,
            members: Vec::new(),
            dns_name: None,
            refresh_interval: Duration::from_secs(10),
        }
    }
}

/// Credential persistence settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file to persist credentials in; in-memory when absent
    pub path: Option<PathBuf>,
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
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
