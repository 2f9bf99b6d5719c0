//! Configuration Manager

use super::{Config, DialerConfig, Endpoint, HandlerKind, ListenerConfig};
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(log_level) = std::env::var("TCPLINK_LOG_LEVEL") {
            config.general.log_level = log_level;
        }

        if let Ok(timeout) = std::env::var("TCPLINK_SHUTDOWN_TIMEOUT") {
            config.general.shutdown_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TCPLINK_SHUTDOWN_TIMEOUT: {}", timeout))?;
        }

        if let Ok(listen) = std::env::var("TCPLINK_LISTEN") {
            let endpoint = Endpoint::parse(&listen)
                .with_context(|| format!("Invalid TCPLINK_LISTEN: {}", listen))?;
            config
                .listeners
                .push(ListenerConfig::new(endpoint.address, endpoint.port));
        }

        if let Ok(connect) = std::env::var("TCPLINK_CONNECT") {
            let endpoint = Endpoint::parse(&connect)
                .with_context(|| format!("Invalid TCPLINK_CONNECT: {}", connect))?;
            config
                .dialers
                .push(DialerConfig::new(endpoint.address, endpoint.port));
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_general_config()
            .with_context(|| "General configuration validation failed")?;

        for (i, listener) in self.listeners.iter().enumerate() {
            Self::validate_listener_config(listener)
                .with_context(|| format!("Listener {} configuration validation failed", i))?;
        }

        for (i, dialer) in self.dialers.iter().enumerate() {
            Self::validate_dialer_config(dialer)
                .with_context(|| format!("Dialer {} configuration validation failed", i))?;
        }

        Ok(())
    }

    fn validate_general_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.general.log_level.as_str()) {
            bail!(
                "general.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        if self.general.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than 0");
        }

        if self.general.read_buffer_size < 64 {
            bail!("read_buffer_size must be at least 64 bytes");
        }

        if self.general.read_buffer_size > 1048576 {
            bail!("read_buffer_size cannot exceed 1MB");
        }

        Ok(())
    }

    fn validate_listener_config(listener: &ListenerConfig) -> Result<()> {
        if listener.bind_address.is_empty() {
            bail!("bind_address must not be empty");
        }

        if listener.bind_port == 0 {
            bail!("bind_port must be between 1 and 65535");
        }

        if listener.bind_retry_delay.is_zero() {
            bail!("bind_retry_delay must be greater than 0");
        }

        Ok(())
    }

    fn validate_dialer_config(dialer: &DialerConfig) -> Result<()> {
        if dialer.remote_address.is_empty() {
            bail!("remote_address must not be empty");
        }

        if dialer.remote_port == 0 {
            bail!("remote_port must be between 1 and 65535");
        }

        if let Some(local) = &dialer.local_address {
            if local.is_empty() {
                bail!("local_address must not be empty when set");
            }
        }

        if dialer.max_source_port_retries == 0 {
            bail!("max_source_port_retries must be at least 1");
        }

        let last_port = u32::from(dialer.local_port).checked_add(dialer.max_source_port_retries);
        if dialer.local_port != 0 && last_port.map_or(true, |port| port > 65535) {
            bail!(
                "local_port {} + max_source_port_retries {} exceeds the port range",
                dialer.local_port,
                dialer.max_source_port_retries
            );
        }

        if dialer.retry_delay.is_zero() {
            bail!("retry_delay must be greater than 0");
        }

        if matches!(dialer.connect_timeout, Some(t) if t.is_zero()) {
            bail!("connect_timeout must be greater than 0 when set");
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        listen: &[String],
        connect: &[String],
        source: Option<&str>,
        echo: bool,
        log_level: Option<&str>,
    ) {
        if let Some(level) = log_level {
            self.general.log_level = level.to_string();
            tracing::info!("CLI override: log level set to {}", level);
        }

        for text in listen {
            match Endpoint::parse(text) {
                Some(endpoint) => {
                    tracing::info!("CLI override: adding listener on {}", endpoint);
                    self.listeners
                        .push(ListenerConfig::new(endpoint.address, endpoint.port));
                }
                None => tracing::warn!("Invalid listen address provided: {}", text),
            }
        }

        let source = source.and_then(|text| {
            let parsed = Endpoint::parse(text);
            if parsed.is_none() {
                tracing::warn!("Invalid source address provided: {}", text);
            }
            parsed
        });

        for text in connect {
            match Endpoint::parse(text) {
                Some(endpoint) => {
                    tracing::info!("CLI override: adding dialer to {}", endpoint);
                    let mut dialer = DialerConfig::new(endpoint.address, endpoint.port);
                    if let Some(source) = &source {
                        dialer.local_address = Some(source.address.clone());
                        dialer.local_port = source.port;
                    }
                    self.dialers.push(dialer);
                }
                None => tracing::warn!("Invalid connect address provided: {}", text),
            }
        }

        if echo {
            for listener in &mut self.listeners {
                listener.handler = HandlerKind::Echo;
            }
            for dialer in &mut self.dialers {
                dialer.handler = HandlerKind::Echo;
            }
            tracing::info!("CLI override: echo handler enabled");
        }
    }
}
