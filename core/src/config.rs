//! Network configuration (pspnet.toml)
//!
//! Handles loading, saving, and providing defaults for the relay server,
//! the local player identity and socket tunables. Settings are stored in
//! TOML format in the platform-specific config directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::mac::MacAddr;
use crate::matching::MatchingSettings;
use crate::relay::{LoginParameters, RELAY_PORT, RelaySettings};
use crate::socket::ShimSettings;
use crate::syscalls::SyscallDelays;

/// File name inside the config directory
pub const CONFIG_FILE: &str = "pspnet.toml";

/// Networking configuration.
///
/// Every section may be omitted; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NetConfig {
    /// Relay server connection
    #[serde(default)]
    pub relay: RelayConfig,
    /// Who the local player is
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Native socket behaviour
    #[serde(default)]
    pub network: NetworkConfig,
    /// Matching library tunables
    #[serde(default)]
    pub matching: MatchingConfig,
}

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Host name or address of the relay server (default: 127.0.0.1)
    #[serde(default = "default_server")]
    pub server: String,
    /// Relay TCP port (default: 27312)
    #[serde(default = "default_relay_port")]
    pub port: u16,
    /// Ping interval in milliseconds (default: 100)
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_interval_ms: u64,
    /// Upper bound for blocking connects in milliseconds (default: 5000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Receive buffer of the session worker (default: 1024)
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer: usize,
}

/// Local player identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Nickname shown to other players (default: "PSPNet")
    #[serde(default = "default_nickname")]
    pub nickname: String,
    /// Fixed MAC address; a random local one is generated when absent
    #[serde(default)]
    pub mac: Option<String>,
    /// Product code of the running game (default: "ULUS00000")
    #[serde(default = "default_product_code")]
    pub product_code: String,
}

/// Native socket configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Added to every ad-hoc guest port natively (default: 0)
    #[serde(default)]
    pub port_offset: u16,
    /// Address probed to find the outbound interface (default: 8.8.8.8:80)
    #[serde(default = "default_route_probe")]
    pub route_probe: String,
    /// Ask the port manager to forward bound ports (default: true)
    #[serde(default = "default_true")]
    pub enable_port_manager: bool,
    /// Cap for select/poll waits in microseconds (default: 5543210)
    #[serde(default = "default_select_max_timeout_us")]
    pub select_max_timeout_us: u64,
    /// Emulated latency of blocking guest calls in microseconds (default: 500)
    #[serde(default = "default_blocking_delay_us")]
    pub blocking_delay_us: u32,
}

/// Matching library configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Extra member timeout for internet play in microseconds (default: 500000)
    #[serde(default = "default_timeout_slack_us")]
    pub internet_timeout_slack_us: u64,
    /// Worker pause in milliseconds (default: 10)
    #[serde(default = "default_worker_sleep_ms")]
    pub worker_sleep_ms: u64,
}

fn default_server() -> String {
    "127.0.0.1".to_string()
}
fn default_relay_port() -> u16 {
    RELAY_PORT
}
fn default_keepalive_ms() -> u64 {
    100
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_recv_buffer() -> usize {
    1024
}

fn default_nickname() -> String {
    "PSPNet".to_string()
}
fn default_product_code() -> String {
    "ULUS00000".to_string()
}

fn default_route_probe() -> String {
    "8.8.8.8:80".to_string()
}
fn default_true() -> bool {
    true
}
fn default_select_max_timeout_us() -> u64 {
    5_543_210
}
fn default_blocking_delay_us() -> u32 {
    500
}

fn default_timeout_slack_us() -> u64 {
    500_000
}
fn default_worker_sleep_ms() -> u64 {
    10
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            port: default_relay_port(),
            keepalive_interval_ms: default_keepalive_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            recv_buffer: default_recv_buffer(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            nickname: default_nickname(),
            mac: None,
            product_code: default_product_code(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port_offset: 0,
            route_probe: default_route_probe(),
            enable_port_manager: default_true(),
            select_max_timeout_us: default_select_max_timeout_us(),
            blocking_delay_us: default_blocking_delay_us(),
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            internet_timeout_slack_us: default_timeout_slack_us(),
            worker_sleep_ms: default_worker_sleep_ms(),
        }
    }
}

impl NetConfig {
    /// Identity for relay login; draws a random MAC when none is configured
    pub fn login(&self) -> Result<LoginParameters> {
        let mac = match &self.identity.mac {
            Some(text) => text
                .parse::<MacAddr>()
                .with_context(|| format!("identity.mac = {text:?}"))?,
            None => MacAddr::random(),
        };
        Ok(LoginParameters {
            mac,
            nickname: self.identity.nickname.clone(),
            product_code: self.identity.product_code.clone(),
        })
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            server: self.relay.server.clone(),
            port: self.relay.port,
            keepalive_interval: Duration::from_millis(self.relay.keepalive_interval_ms),
            recv_buffer: self.relay.recv_buffer,
            peer_port_offset: self.network.port_offset,
            ..RelaySettings::default()
        }
    }

    pub fn shim_settings(&self) -> Result<ShimSettings> {
        let route_probe: SocketAddr = self
            .network
            .route_probe
            .parse()
            .with_context(|| format!("network.route_probe = {:?}", self.network.route_probe))?;
        Ok(ShimSettings {
            route_probe,
            connect_timeout: Duration::from_millis(self.relay.connect_timeout_ms),
            max_wait_us: self.network.select_max_timeout_us,
            forward_ports: self.network.enable_port_manager,
        })
    }

    pub fn matching_settings(&self) -> MatchingSettings {
        MatchingSettings {
            worker_sleep: Duration::from_millis(self.matching.worker_sleep_ms),
            timeout_slack_us: self.matching.internet_timeout_slack_us,
        }
    }

    pub fn syscall_delays(&self) -> SyscallDelays {
        SyscallDelays {
            blocking_us: self.network.blocking_delay_us,
            ..SyscallDelays::default()
        }
    }
}

/// Returns the platform-specific configuration directory.
///
/// On Windows: `%APPDATA%\PSPNet\config`
/// On macOS: `~/Library/Application Support/org.pspnet.PSPNet`
/// On Linux: `~/.config/PSPNet`
///
/// Returns `None` if the home directory cannot be determined.
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("org.pspnet", "", "PSPNet")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Loads `path`, or defaults when the file does not exist.
pub fn load_from_path(path: &Path) -> Result<NetConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(NetConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Writes `config` to `path`, creating parent directories.
pub fn save_to_path(config: &NetConfig, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let content = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

/// Loads the configuration from the platform's configuration directory.
pub fn load() -> Result<NetConfig> {
    match config_dir() {
        Some(dir) => load_from_path(&dir.join(CONFIG_FILE)),
        None => Ok(NetConfig::default()),
    }
}

/// Saves the configuration to the platform's configuration directory.
pub fn save(config: &NetConfig) -> Result<()> {
    match config_dir() {
        Some(dir) => save_to_path(config, &dir.join(CONFIG_FILE)),
        None => Ok(()),
    }
}
