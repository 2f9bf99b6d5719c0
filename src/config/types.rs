//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub dialers: Vec<DialerConfig>,
}

/// Process-wide settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How long shutdown waits for each service loop to finish
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Size of the scratch buffer used for each socket read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

/// Which stock handler a service uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    #[default]
    Log,
    Echo,
}

/// A host name or IP plus a port
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Parse `host:port` (IPv6 in brackets: `[::1]:80`)
    pub fn parse(text: &str) -> Option<Self> {
        let (host, port) = text.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// Listener service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub name: Option<String>,
    pub bind_address: String,
    pub bind_port: u16,
    /// Wait between bind attempts while the address is in use
    #[serde(default = "default_bind_retry_delay", with = "humantime_serde")]
    pub bind_retry_delay: Duration,
    /// How long stop waits for open sessions to report closure
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
    #[serde(default)]
    pub handler: HandlerKind,
}

impl ListenerConfig {
    pub fn new(bind_address: impl Into<String>, bind_port: u16) -> Self {
        Self {
            name: None,
            bind_address: bind_address.into(),
            bind_port,
            bind_retry_delay: default_bind_retry_delay(),
            drain_timeout: default_drain_timeout(),
            handler: HandlerKind::default(),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.bind_address.clone(), self.bind_port)
    }

    /// Configured name, or one derived from the bind endpoint
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("TCP server at {}", self.endpoint()))
    }
}

/// Dialer service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DialerConfig {
    pub name: Option<String>,
    pub remote_address: String,
    pub remote_port: u16,
    pub local_address: Option<String>,
    /// Local source port; 0 lets the OS choose
    #[serde(default)]
    pub local_port: u16,
    #[serde(default = "default_max_source_port_retries")]
    pub max_source_port_retries: u32,
    /// Wait after a refused/timed out attempt or a dropped connection
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    #[serde(default)]
    pub handler: HandlerKind,
}

impl DialerConfig {
    pub fn new(remote_address: impl Into<String>, remote_port: u16) -> Self {
        Self {
            name: None,
            remote_address: remote_address.into(),
            remote_port,
            local_address: None,
            local_port: 0,
            max_source_port_retries: default_max_source_port_retries(),
            retry_delay: default_retry_delay(),
            connect_timeout: None,
            handler: HandlerKind::default(),
        }
    }

    pub fn remote(&self) -> Endpoint {
        Endpoint::new(self.remote_address.clone(), self.remote_port)
    }

    /// Configured name, or one derived from the remote endpoint
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("TCP connection to {}", self.remote()))
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            shutdown_timeout: default_shutdown_timeout(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_bind_retry_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_source_port_retries() -> u32 {
    128
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}
