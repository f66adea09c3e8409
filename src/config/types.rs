//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Transport the listener serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listening session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Local endpoint; a multicast address joins the group.
    pub bind_addr: SocketAddr,
    pub transport: Transport,
    /// Read/receive buffer length in bytes
    pub buffer_len: usize,
    /// Number of flows to serve before exiting, 0 = unlimited
    #[serde(default)]
    pub max_flows: usize,
    /// Serve one remote host at a time
    #[serde(default)]
    pub single_client: bool,
    /// Handle every datagram flow inside the listener task
    #[serde(default)]
    pub single_udp: bool,
    /// Only accept flows from this host
    #[serde(default)]
    pub client_filter: Option<IpAddr>,
    /// Skip the header exchange for peers that predate it
    #[serde(default)]
    pub compat: bool,
    #[serde(default, with = "humantime_serde")]
    pub report_interval: Option<Duration>,
    /// Server run duration; bounds each accept wait
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub daemon: bool,
    /// Keep listening when a duration-expiry interrupt arrives
    #[serde(default)]
    pub repeat: bool,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    pub fn is_multicast(&self) -> bool {
        self.bind_addr.ip().is_multicast()
    }

    /// Whether accept waits are bounded by the run duration.
    pub fn accept_deadline(&self) -> Option<Duration> {
        if self.daemon {
            return None;
        }
        self.duration.filter(|d| !d.is_zero())
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_addr: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_addr: SocketAddr::from(([0, 0, 0, 0], 5001)),
                transport: Transport::Tcp,
                buffer_len: 128 * 1024,
                max_flows: 0,
                single_client: false,
                single_udp: false,
                client_filter: None,
                compat: false,
                report_interval: None,
                duration: None,
                daemon: false,
                repeat: false,
                handshake_timeout: Duration::from_secs(10),
                shutdown_timeout: Duration::from_secs(30),
            },
            monitoring: MonitoringConfig::default(),
        }
    }
}
