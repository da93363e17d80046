//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub relay: RelaySettings,
    pub peers: PeersConfig,
    /// Observer that receives a copy of downstream traffic (`host:port`)
    #[serde(default)]
    pub third_party: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local listener settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelaySettings {
    pub bind_ip: Ipv4Addr,
    pub port: u16,
    /// Address written into rewritten `serverip=` fields; defaults to `bind_ip`
    #[serde(default)]
    pub advertise_ip: Option<Ipv4Addr>,
    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    #[serde(default)]
    pub max_sessions: Option<usize>,
}

/// The two known peers. Both listen on the relay port on their own hosts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeersConfig {
    pub downstream: IpAddr,
    pub upstream: IpAddr,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Legacy JSON layout used by older deployments
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyConfig {
    #[serde(rename = "IPArray")]
    pub ip_array: [IpAddr; 2],
    #[serde(rename = "ThirdPartyAddr", default)]
    pub third_party_addr: String,
    #[serde(rename = "IP")]
    pub ip: Ipv4Addr,
    #[serde(rename = "Port")]
    pub port: u16,
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl RelaySettings {
    /// IP the relay reports as its own in rewritten traffic
    pub fn local_ip(&self) -> Ipv4Addr {
        self.advertise_ip.unwrap_or(self.bind_ip)
    }

    /// Listen endpoint as a socket address
    pub fn bind_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(IpAddr::V4(self.bind_ip), self.port)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl From<LegacyConfig> for Config {
    fn from(legacy: LegacyConfig) -> Self {
        let third_party = Some(legacy.third_party_addr).filter(|addr| !addr.trim().is_empty());

        Self {
            relay: RelaySettings {
                bind_ip: legacy.ip,
                port: legacy.port,
                advertise_ip: None,
                dial_timeout: default_dial_timeout(),
                shutdown_timeout: default_shutdown_timeout(),
                max_sessions: None,
            },
            peers: PeersConfig {
                downstream: legacy.ip_array[0],
                upstream: legacy.ip_array[1],
            },
            third_party,
            logging: LoggingConfig::default(),
        }
    }
}
