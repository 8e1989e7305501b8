use crate::backends::firefly::{SourceOverrides, DEFAULT_FIREFLY_PORT};
use crate::backends::BackendKind;
use crate::discovery::STUN_SERVERS;
use crate::error::{FlowError, FlowResult};
use crate::flow::Identifier;
use crate::net::InternalNetworks;
use crate::sources::SourceKind;
use crate::tracker::{IdentifierPolicy, TrackerMode, DEFAULT_IDENTIFIER_POOL};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration files tried in order when none is given.
pub const DEFAULT_PATHS: &[&str] = &[
    "/etc/flowd/flowd.toml",
    "~/.flowd/flowd.toml",
    "./flowd.toml",
];

/// Top-level configuration for the flowd daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub firefly: FireflyConfig,
    #[serde(default)]
    pub flow_label: FlowLabelConfig,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Daemon runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Grace period for each task after shutdown is requested
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            join_timeout_secs: default_join_timeout(),
        }
    }
}

/// Producer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: String,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// CIDR ranges whose destinations are never reported
    #[serde(default)]
    pub internal_networks: Vec<String>,
    pub experiment: Option<String>,
    pub activity: Option<String>,
    /// Report connections that predate the daemon as `ongoing`
    #[serde(default)]
    pub announce_preexisting: bool,
    /// (experiment, activity) pairs drawn by the iperf source
    #[serde(default = "default_pool")]
    pub pool: Vec<(u32, u32)>,
    #[serde(default = "default_ss_path")]
    pub ss_path: String,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_firefly_port")]
    pub listen_port: u16,
    #[serde(default = "default_pipe_path")]
    pub pipe_path: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            interval_secs: default_interval(),
            internal_networks: Vec::new(),
            experiment: None,
            activity: None,
            announce_preexisting: false,
            pool: default_pool(),
            ss_path: default_ss_path(),
            listen_host: default_listen_host(),
            listen_port: default_firefly_port(),
            pipe_path: default_pipe_path(),
        }
    }
}

impl SourceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn listen_addr(&self) -> FlowResult<SocketAddr> {
        let ip: IpAddr = self.listen_host.parse().map_err(|_| {
            FlowError::Configuration(format!("invalid listen_host '{}'", self.listen_host))
        })?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    pub fn tracker_mode(&self) -> TrackerMode {
        if self.announce_preexisting {
            TrackerMode::AnnouncePreexisting
        } else {
            TrackerMode::Strict
        }
    }
}

/// Experiment/activity registry location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub url: Option<String>,
    pub file: Option<String>,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default = "default_backends")]
    pub enabled: Vec<String>,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            enabled: default_backends(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireflyConfig {
    #[serde(default = "default_firefly_port")]
    pub port: u16,
    /// Collector that receives a copy of every firefly (IPv4)
    pub collector: Option<String>,
    pub ip4_src: Option<Ipv4Addr>,
    pub ip6_src: Option<Ipv6Addr>,
}

impl Default for FireflyConfig {
    fn default() -> Self {
        Self {
            port: default_firefly_port(),
            collector: None,
            ip4_src: None,
            ip6_src: None,
        }
    }
}

impl FireflyConfig {
    pub fn overrides(&self) -> SourceOverrides {
        SourceOverrides {
            ip4: self.ip4_src,
            ip6: self.ip6_src,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowLabelConfig {
    /// Empty means every interface with a global IPv6 address
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default = "default_ebpf_object")]
    pub object: String,
}

impl Default for FlowLabelConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            object: default_ebpf_object(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default = "default_prometheus_port")]
    pub port: u16,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            port: default_prometheus_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stuns")]
    pub stun_servers: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stun_servers: default_stuns(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_join_timeout() -> u64 {
    5
}
fn default_source_kind() -> String {
    "netstat".to_string()
}
fn default_interval() -> u64 {
    30
}
fn default_pool() -> Vec<(u32, u32)> {
    DEFAULT_IDENTIFIER_POOL.to_vec()
}
fn default_ss_path() -> String {
    "/sbin/ss".to_string()
}
fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}
fn default_firefly_port() -> u16 {
    DEFAULT_FIREFLY_PORT
}
#[cfg(unix)]
fn default_pipe_path() -> String {
    crate::sources::pipe::DEFAULT_PIPE_PATH.to_string()
}
#[cfg(not(unix))]
fn default_pipe_path() -> String {
    String::new()
}
fn default_backends() -> Vec<String> {
    vec!["firefly".to_string()]
}
fn default_ebpf_object() -> String {
    "/usr/lib/flowd/flowd-ebpf".to_string()
}
fn default_prometheus_port() -> u16 {
    9000
}
fn default_true() -> bool {
    true
}
fn default_stuns() -> Vec<String> {
    STUN_SERVERS.iter().map(|s| s.to_string()).collect()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse TOML config")?;
        Ok(config)
    }

    /// First existing file of [`DEFAULT_PATHS`], if any.
    pub fn find_default() -> Option<PathBuf> {
        DEFAULT_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).to_string()))
            .find(|path| path.exists())
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Result<Self> {
        match Self::find_default() {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn source_kind(&self) -> FlowResult<SourceKind> {
        self.source.kind.parse()
    }

    /// Enabled backends, duplicates removed.
    pub fn backend_kinds(&self) -> FlowResult<Vec<BackendKind>> {
        let mut kinds = Vec::new();
        for name in &self.backends.enabled {
            let kind: BackendKind = name.parse()?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    pub fn internal_networks(&self) -> FlowResult<InternalNetworks> {
        InternalNetworks::parse(&self.source.internal_networks)
    }

    /// Identifier policy of the polling sources.
    pub fn identifier_policy(&self) -> FlowResult<IdentifierPolicy> {
        if self.source_kind()? == SourceKind::Iperf {
            return IdentifierPolicy::pool(self.source.pool.clone());
        }
        let experiment = self.source.experiment.as_deref().ok_or_else(|| {
            FlowError::Configuration(format!(
                "source '{}' needs source.experiment",
                self.source.kind
            ))
        })?;
        Ok(IdentifierPolicy::Static {
            experiment: Identifier::from_text(experiment),
            activity: self
                .source
                .activity
                .as_deref()
                .filter(|a| !a.trim().is_empty())
                .map(Identifier::from_text),
        })
    }

    /// Check everything that would otherwise fail after tasks are started.
    pub fn validate(&self) -> FlowResult<()> {
        let source = self.source_kind()?;
        let backends = self.backend_kinds()?;
        if backends.is_empty() {
            return Err(FlowError::Configuration("no backend enabled".to_string()));
        }
        self.internal_networks()?;

        match source {
            SourceKind::Netstat | SourceKind::Netlink | SourceKind::Iperf => {
                if self.source.interval_secs == 0 {
                    return Err(FlowError::Configuration(
                        "source.interval_secs must be positive".to_string(),
                    ));
                }
                self.identifier_policy()?;
            }
            SourceKind::Firefly => {
                self.source.listen_addr()?;
            }
            SourceKind::NpApi => {
                if self.source.pipe_path.trim().is_empty() {
                    return Err(FlowError::Configuration("source.pipe_path is empty".to_string()));
                }
            }
        }

        if self.registry.url.is_none() && self.registry.file.is_none() {
            return Err(FlowError::Configuration(
                "registry.url or registry.file is required".to_string(),
            ));
        }
        if self.daemon.join_timeout_secs == 0 {
            return Err(FlowError::Configuration(
                "daemon.join_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
