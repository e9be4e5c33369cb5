// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingest server configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file is a
//! valid configuration (listen on port 5123, static registry, stdout sink).

use crate::protocol::guard;
use crate::registry::DeviceSeed;
use crate::server::session::SessionSettings;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Metrics snapshot logging interval (seconds, 0 to disable).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Log level or `EnvFilter` directives.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub sink: SinkConfig,
}

fn default_stats_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: default_stats_interval(),
            log_level: default_log_level(),
            server: ServerSettings::default(),
            registry: RegistryConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

/// `[server]` section: listener and session limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Bind address (0.0.0.0 for all interfaces).
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port. 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Socket read timeout; bounds how late a session notices a stop request.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// A session receiving nothing for this long is closed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Registry re-read cadence while a session is streaming.
    #[serde(default = "default_params_poll_interval_ms")]
    pub params_poll_interval_ms: u64,

    /// Bytes requested per socket read.
    #[serde(default = "default_recv_size")]
    pub recv_size: usize,

    /// Reads attempted before an unidentified connection is dropped.
    #[serde(default = "default_max_identify_reads")]
    pub max_identify_reads: usize,

    /// Largest unframed tail a session may hold.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,

    /// Largest declared FBGuard message size accepted.
    #[serde(default = "default_max_guard_message")]
    pub max_guard_message_bytes: usize,

    #[serde(default)]
    pub keepalive: KeepaliveSettings,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    5123
}

fn default_read_timeout_ms() -> u64 {
    3000
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_params_poll_interval_ms() -> u64 {
    1000
}

fn default_recv_size() -> usize {
    4096
}

fn default_max_identify_reads() -> usize {
    1024
}

fn default_max_buffer_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_max_guard_message() -> usize {
    1024 * 1024
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            read_timeout_ms: default_read_timeout_ms(),
            idle_timeout_secs: default_idle_timeout(),
            params_poll_interval_ms: default_params_poll_interval_ms(),
            recv_size: default_recv_size(),
            max_identify_reads: default_max_identify_reads(),
            max_buffer_bytes: default_max_buffer_bytes(),
            max_guard_message_bytes: default_max_guard_message(),
            keepalive: KeepaliveSettings::default(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn params_poll_interval(&self) -> Duration {
        Duration::from_millis(self.params_poll_interval_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            read_timeout: self.read_timeout(),
            idle_timeout: self.idle_timeout(),
            params_poll_interval: self.params_poll_interval(),
            max_guard_message: self.max_guard_message_bytes,
        }
    }
}

/// TCP keep-alive probing, used to detect dead peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepaliveSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_keepalive_idle")]
    pub idle_secs: u64,

    #[serde(default = "default_keepalive_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_keepalive_retries")]
    pub retries: u32,
}

fn default_true() -> bool {
    true
}

fn default_keepalive_idle() -> u64 {
    15
}

fn default_keepalive_interval() -> u64 {
    1
}

fn default_keepalive_retries() -> u32 {
    3
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_secs: default_keepalive_idle(),
            interval_secs: default_keepalive_interval(),
            retries: default_keepalive_retries(),
        }
    }
}

/// `[registry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum RegistryConfig {
    /// Devices listed inline; nothing persists across restarts.
    Static {
        #[serde(default)]
        devices: Vec<DeviceSeed>,
    },
    /// Control-center SQLite database.
    Sqlite { path: PathBuf },
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::Static {
            devices: Vec::new(),
        }
    }
}

/// `[sink]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Line protocol on stdout.
    Stdout,
    /// InfluxDB v2 HTTP write API. Each measurement run writes to the bucket
    /// named after it.
    Influx {
        #[serde(default = "default_influx_url")]
        url: String,
        #[serde(default = "default_influx_org")]
        org: String,
        #[serde(default)]
        token: String,
        #[serde(default = "default_influx_timeout")]
        timeout_secs: u64,
    },
}

pub(crate) fn default_influx_url() -> String {
    "http://influxdb:8086".to_string()
}

pub(crate) fn default_influx_org() -> String {
    "main".to_string()
}

fn default_influx_timeout() -> u64 {
    10
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self::Stdout
    }
}

impl SinkConfig {
    /// Influx sink with default url, org and timeout.
    pub fn influx(token: impl Into<String>) -> Self {
        Self::Influx {
            url: default_influx_url(),
            org: default_influx_org(),
            token: token.into(),
            timeout_secs: default_influx_timeout(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("read_timeout_ms must be > 0".into()));
        }
        if server.params_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "params_poll_interval_ms must be > 0".into(),
            ));
        }
        if server.idle_timeout() < server.read_timeout() {
            return Err(ConfigError::Invalid(format!(
                "idle_timeout_secs ({}) is shorter than the read timeout ({} ms)",
                server.idle_timeout_secs, server.read_timeout_ms
            )));
        }
        if server.recv_size == 0 {
            return Err(ConfigError::Invalid("recv_size must be > 0".into()));
        }
        if server.max_identify_reads == 0 {
            return Err(ConfigError::Invalid("max_identify_reads must be > 0".into()));
        }
        let smallest_guard = guard::message_size(0);
        if server.max_guard_message_bytes < smallest_guard {
            return Err(ConfigError::Invalid(format!(
                "max_guard_message_bytes must be at least {}",
                smallest_guard
            )));
        }
        if server.max_buffer_bytes < server.max_guard_message_bytes {
            return Err(ConfigError::Invalid(format!(
                "max_buffer_bytes ({}) cannot hold a {} byte FBGuard message",
                server.max_buffer_bytes, server.max_guard_message_bytes
            )));
        }

        match &self.registry {
            RegistryConfig::Static { devices } => {
                for (i, device) in devices.iter().enumerate() {
                    if device.name.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "registry.devices[{}]: empty name",
                            i
                        )));
                    }
                    if devices[..i].iter().any(|d| d.name == device.name) {
                        return Err(ConfigError::Invalid(format!(
                            "registry.devices[{}]: duplicate device '{}'",
                            i, device.name
                        )));
                    }
                    if device.sensors.len() > usize::from(u8::MAX) {
                        return Err(ConfigError::Invalid(format!(
                            "device '{}': more than {} sensors",
                            device.name,
                            u8::MAX
                        )));
                    }
                    for sensor in &device.sensors {
                        if let Some(spm) = sensor.samples_per_message {
                            if spm == 0 || spm > crate::protocol::node::MAX_SAMPLES_PER_MESSAGE {
                                return Err(ConfigError::Invalid(format!(
                                    "device '{}' sensor '{}': samples_per_message {} out of range 1..={}",
                                    device.name,
                                    sensor.name,
                                    spm,
                                    crate::protocol::node::MAX_SAMPLES_PER_MESSAGE
                                )));
                            }
                        }
                    }
                }
            }
            RegistryConfig::Sqlite { path } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::Invalid("registry.path is empty".into()));
                }
            }
        }

        if let SinkConfig::Influx { url, .. } = &self.sink {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "sink.url must be http(s): {}",
                    url
                )));
            }
        }
        Ok(())
    }
}
