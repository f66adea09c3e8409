//! Configuration Manager

use super::{Config, Transport};
use crate::protocol::{CLIENT_HEADER_MAX_LEN, DATAGRAM_HEADER_LEN};
use crate::Result;
use anyhow::{bail, Context};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let mut config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config.validate().context("Configuration validation failed")?;
            config.normalize();

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(bind_addr) = std::env::var("FLOWGATE_BIND_ADDR") {
            config.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid FLOWGATE_BIND_ADDR: {}", bind_addr))?;
        }

        if let Ok(transport) = std::env::var("FLOWGATE_TRANSPORT") {
            config.server.transport = match transport.to_ascii_lowercase().as_str() {
                "tcp" => Transport::Tcp,
                "udp" => Transport::Udp,
                other => bail!("Invalid FLOWGATE_TRANSPORT: {}", other),
            };
        }

        if let Ok(buffer_len) = std::env::var("FLOWGATE_BUFFER_LEN") {
            config.server.buffer_len = buffer_len
                .parse::<usize>()
                .with_context(|| format!("Invalid FLOWGATE_BUFFER_LEN: {}", buffer_len))?;
        }

        if let Ok(max_flows) = std::env::var("FLOWGATE_MAX_FLOWS") {
            config.server.max_flows = max_flows
                .parse::<usize>()
                .with_context(|| format!("Invalid FLOWGATE_MAX_FLOWS: {}", max_flows))?;
        }

        if let Ok(duration) = std::env::var("FLOWGATE_DURATION") {
            config.server.duration = Some(
                humantime::parse_duration(&duration)
                    .with_context(|| format!("Invalid FLOWGATE_DURATION: {}", duration))?,
            );
        }

        if let Ok(interval) = std::env::var("FLOWGATE_REPORT_INTERVAL") {
            config.server.report_interval = Some(
                humantime::parse_duration(&interval)
                    .with_context(|| format!("Invalid FLOWGATE_REPORT_INTERVAL: {}", interval))?,
            );
        }

        if let Ok(filter) = std::env::var("FLOWGATE_CLIENT_FILTER") {
            config.server.client_filter = Some(
                filter
                    .parse::<IpAddr>()
                    .with_context(|| format!("Invalid FLOWGATE_CLIENT_FILTER: {}", filter))?,
            );
        }

        if let Ok(log_level) = std::env::var("FLOWGATE_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        config.normalize();
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .context("Server configuration validation failed")?;

        self.validate_monitoring_config()
            .context("Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        let server = &self.server;

        if server.buffer_len == 0 {
            bail!("buffer_len must be greater than 0");
        }

        if server.buffer_len > 1024 * 1024 {
            bail!("buffer_len cannot exceed 1MB");
        }

        if server.single_udp && server.transport != Transport::Udp {
            bail!("single_udp requires the udp transport");
        }

        if server.handshake_timeout.is_zero() {
            bail!("handshake_timeout must be greater than 0");
        }

        if let Some(filter) = server.client_filter {
            if filter.is_unspecified() {
                bail!("client_filter cannot be the unspecified address");
            }
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Adjust buffer sizes the listener cannot work with.
    pub fn normalize(&mut self) {
        let server = &mut self.server;
        let exchange_len = match server.transport {
            Transport::Udp => DATAGRAM_HEADER_LEN + CLIENT_HEADER_MAX_LEN,
            Transport::Tcp => CLIENT_HEADER_MAX_LEN,
        };

        if !server.compat && server.buffer_len < exchange_len {
            tracing::warn!(
                buffer_len = server.buffer_len,
                needed = exchange_len,
                "Buffer length too small for the peer exchange"
            );
        }

        if server.transport == Transport::Udp && server.buffer_len < DATAGRAM_HEADER_LEN {
            server.buffer_len = DATAGRAM_HEADER_LEN;
            tracing::warn!(
                buffer_len = server.buffer_len,
                "Buffer length raised to hold the datagram marker"
            );
        }
    }

    /// Merge with CLI arguments
    #[allow(clippy::too_many_arguments)]
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        udp: bool,
        single_udp: bool,
        single_client: bool,
        client: Option<IpAddr>,
        max_flows: Option<usize>,
        interval: Option<Duration>,
        duration: Option<Duration>,
        buffer_len: Option<usize>,
        compat: bool,
        daemon: bool,
    ) {
        if let Some(bind_str) = bind {
            if let Ok(addr) = bind_str.parse::<SocketAddr>() {
                self.server.bind_addr = addr;
                tracing::info!("CLI override: bind address set to {}", addr);
            } else if let Ok(ip) = bind_str.parse::<IpAddr>() {
                self.server.bind_addr.set_ip(ip);
                tracing::info!("CLI override: bind host set to {}", ip);
            } else {
                tracing::warn!("Invalid bind address provided: {}", bind_str);
            }
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if udp || single_udp {
            self.server.transport = Transport::Udp;
            tracing::info!("CLI override: transport set to udp");
        }

        if single_udp {
            self.server.single_udp = true;
            tracing::info!("CLI override: single-context UDP enabled");
        }

        if single_client {
            self.server.single_client = true;
            tracing::info!("CLI override: single client mode enabled");
        }

        if let Some(client) = client {
            self.server.client_filter = Some(client);
            tracing::info!("CLI override: only accepting flows from {}", client);
        }

        if let Some(max_flows) = max_flows {
            self.server.max_flows = max_flows;
            tracing::info!("CLI override: max flows set to {}", max_flows);
        }

        if let Some(interval) = interval {
            self.server.report_interval = Some(interval);
            tracing::info!("CLI override: report interval set to {:?}", interval);
        }

        if let Some(duration) = duration {
            self.server.duration = Some(duration);
            tracing::info!("CLI override: run duration set to {:?}", duration);
        }

        if let Some(buffer_len) = buffer_len {
            self.server.buffer_len = buffer_len;
            tracing::info!("CLI override: buffer length set to {} bytes", buffer_len);
        }

        if compat {
            self.server.compat = true;
            tracing::info!("CLI override: compatibility mode enabled");
        }

        if daemon {
            self.server.daemon = true;
            tracing::info!("CLI override: daemon mode enabled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_single_udp_requires_udp() {
        let mut config = Config::default();
        config.server.single_udp = true;
        assert!(config.validate().is_err());

        config.server.transport = Transport::Udp;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_small_udp_buffer_is_raised() {
        let mut config = Config::default();
        config.server.transport = Transport::Udp;
        config.server.buffer_len = 4;
        config.normalize();
        assert_eq!(config.server.buffer_len, DATAGRAM_HEADER_LEN);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
bind_addr = "127.0.0.1:5201"
transport = "udp"
buffer_len = 1470
single_udp = true
report_interval = "1s"
duration = "10s"
handshake_timeout = "5s"
shutdown_timeout = "30s"

[monitoring]
log_level = "debug"
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.transport, Transport::Udp);
        assert!(config.server.single_udp);
        assert_eq!(config.server.report_interval, Some(Duration::from_secs(1)));
        assert_eq!(config.server.accept_deadline(), Some(Duration::from_secs(10)));
        assert_eq!(config.monitoring.log_level, "debug");
    }

    #[test]
    fn test_daemon_has_no_accept_deadline() {
        let mut config = Config::default();
        config.server.duration = Some(Duration::from_secs(5));
        config.server.daemon = true;
        assert_eq!(config.server.accept_deadline(), None);
    }
}
