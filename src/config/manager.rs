//! Configuration Manager

use super::{Config, LegacyConfig};
use crate::Result;
use anyhow::{bail, Context};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Longest dial timeout accepted from configuration
const MAX_DIAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file.
    ///
    /// Files with a `.json` extension use the legacy layout
    /// (`IPArray`, `ThirdPartyAddr`, `IP`, `Port`); everything else is TOML.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if !path.exists() {
            bail!("Configuration file not found: {}", path.display());
        }

        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config = if is_json {
            Self::parse_legacy_json(&content)
        } else {
            Self::parse_toml(&content)
        }
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        tracing::info!("Configuration loaded and validated successfully");
        Ok(config)
    }

    /// Parse a TOML configuration document
    pub fn parse_toml(content: &str) -> Result<Config> {
        Ok(toml::from_str(content)?)
    }

    /// Parse the legacy JSON configuration document
    pub fn parse_legacy_json(content: &str) -> Result<Config> {
        let legacy: LegacyConfig = serde_json::from_str(content)?;
        Ok(legacy.into())
    }

    /// Apply environment variable overrides on top of `config`
    pub fn load_from_env(mut config: Config) -> Result<Config> {
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Override fields from `TRANSIT_*` variables returned by `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind_ip) = lookup("TRANSIT_BIND_IP") {
            self.relay.bind_ip = bind_ip
                .parse::<Ipv4Addr>()
                .with_context(|| format!("Invalid TRANSIT_BIND_IP: {}", bind_ip))?;
        }

        if let Some(port) = lookup("TRANSIT_PORT") {
            self.relay.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid TRANSIT_PORT: {}", port))?;
        }

        if let Some(downstream) = lookup("TRANSIT_DOWNSTREAM") {
            self.peers.downstream = downstream
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid TRANSIT_DOWNSTREAM: {}", downstream))?;
        }

        if let Some(upstream) = lookup("TRANSIT_UPSTREAM") {
            self.peers.upstream = upstream
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid TRANSIT_UPSTREAM: {}", upstream))?;
        }

        if let Some(third_party) = lookup("TRANSIT_THIRD_PARTY") {
            self.third_party = Some(third_party).filter(|addr| !addr.is_empty());
        }

        if let Some(timeout) = lookup("TRANSIT_DIAL_TIMEOUT") {
            self.relay.dial_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TRANSIT_DIAL_TIMEOUT: {}", timeout))?;
        }

        if let Some(level) = lookup("TRANSIT_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_peers_config()
            .with_context(|| "Peer configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        if self.relay.port == 0 {
            bail!("relay.port must be greater than 0");
        }

        if self.relay.dial_timeout.is_zero() {
            bail!("relay.dial_timeout must be greater than 0");
        }

        if self.relay.dial_timeout > MAX_DIAL_TIMEOUT {
            bail!("relay.dial_timeout cannot exceed {:?}", MAX_DIAL_TIMEOUT);
        }

        if self.relay.max_sessions == Some(0) {
            bail!("relay.max_sessions must be greater than 0 when set");
        }

        if self.relay.advertise_ip.is_none() && self.relay.bind_ip.is_unspecified() {
            tracing::warn!(
                "relay.bind_ip is {} and no advertise_ip is set; rewritten serverip fields will carry it verbatim",
                self.relay.bind_ip
            );
        }

        Ok(())
    }

    fn validate_peers_config(&self) -> Result<()> {
        if self.peers.downstream == self.peers.upstream {
            bail!(
                "peers.downstream and peers.upstream must differ (both are {})",
                self.peers.downstream
            );
        }

        if let Some(third_party) = &self.third_party {
            match third_party.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() => {
                    let port = port
                        .parse::<u16>()
                        .with_context(|| format!("third_party has an invalid port: {}", third_party))?;
                    if port == 0 {
                        bail!("third_party port must be greater than 0: {}", third_party);
                    }
                }
                _ => bail!("third_party must be in host:port form: {}", third_party),
            }
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind_ip: Option<&str>,
        port: Option<u16>,
        third_party: Option<&str>,
        log_level: Option<&str>,
    ) {
        if let Some(bind_str) = bind_ip {
            if let Ok(ip) = bind_str.parse::<Ipv4Addr>() {
                self.relay.bind_ip = ip;
                tracing::info!("CLI override: bind ip set to {}", ip);
            } else {
                tracing::warn!("Invalid bind ip provided: {}", bind_str);
            }
        }

        if let Some(port) = port {
            self.relay.port = port;
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(third_party) = third_party {
            self.third_party = Some(third_party.to_string()).filter(|addr| !addr.is_empty());
            tracing::info!("CLI override: third party set to {:?}", self.third_party);
        }

        if let Some(level) = log_level {
            self.logging.level = level.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE_TOML: &str = r#"
third_party = "10.0.0.3:9000"

[relay]
bind_ip = "10.0.0.9"
port = 7001
dial_timeout = "3s"

[peers]
downstream = "10.0.0.1"
upstream = "10.0.0.2"
"#;

    #[test]
    fn test_parse_toml_with_defaults() {
        let config = ConfigManager::parse_toml(SAMPLE_TOML).unwrap();

        assert_eq!(config.relay.bind_ip, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(config.relay.port, 7001);
        assert_eq!(config.relay.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.relay.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.relay.max_sessions, None);
        assert_eq!(config.third_party.as_deref(), Some("10.0.0.3:9000"));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_legacy_json() {
        let json = r#"{
            "IPArray": ["10.0.0.1", "10.0.0.2"],
            "ThirdPartyAddr": "10.0.0.3:9000",
            "IP": "10.0.0.9",
            "Port": 7001
        }"#;

        let config = ConfigManager::parse_legacy_json(json).unwrap();
        assert_eq!(config.peers.downstream, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(config.peers.upstream, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(config.relay.local_ip(), Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(config.relay.port, 7001);
        assert_eq!(config.third_party.as_deref(), Some("10.0.0.3:9000"));
    }

    #[test]
    fn test_legacy_json_empty_third_party() {
        let json = r#"{"IPArray": ["10.0.0.1", "10.0.0.2"], "ThirdPartyAddr": "", "IP": "10.0.0.9", "Port": 7001}"#;
        let config = ConfigManager::parse_legacy_json(json).unwrap();
        assert!(config.third_party.is_none());
    }

    #[test]
    fn test_identical_peers_rejected() {
        let mut config = ConfigManager::parse_toml(SAMPLE_TOML).unwrap();
        config.peers.upstream = config.peers.downstream;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_third_party_rejected() {
        let mut config = ConfigManager::parse_toml(SAMPLE_TOML).unwrap();

        config.third_party = Some("no-port-here".to_string());
        assert!(config.validate().is_err());

        config.third_party = Some("observer:notaport".to_string());
        assert!(config.validate().is_err());

        config.third_party = Some("observer.local:9000".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_port_and_timeout_rejected() {
        let mut config = ConfigManager::parse_toml(SAMPLE_TOML).unwrap();
        config.relay.port = 0;
        assert!(config.validate().is_err());

        let mut config = ConfigManager::parse_toml(SAMPLE_TOML).unwrap();
        config.relay.dial_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ConfigManager::parse_toml(SAMPLE_TOML).unwrap();
        config.relay.max_sessions = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigManager::parse_toml(SAMPLE_TOML).unwrap();
        let vars: HashMap<&str, &str> = [
            ("TRANSIT_PORT", "8002"),
            ("TRANSIT_UPSTREAM", "10.0.0.20"),
            ("TRANSIT_DIAL_TIMEOUT", "750ms"),
            ("TRANSIT_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        config
            .apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.relay.port, 8002);
        assert_eq!(config.peers.upstream, "10.0.0.20".parse::<IpAddr>().unwrap());
        assert_eq!(config.relay.dial_timeout, Duration::from_millis(750));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_env_override_is_error() {
        let mut config = ConfigManager::parse_toml(SAMPLE_TOML).unwrap();
        let result = config.apply_env_overrides(|key| {
            (key == "TRANSIT_PORT").then(|| "seventy".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = ConfigManager::parse_toml(SAMPLE_TOML).unwrap();
        config.merge_with_cli_args(Some("127.0.0.1"), Some(9100), Some(""), Some("warn"));

        assert_eq!(config.relay.bind_ip, Ipv4Addr::LOCALHOST);
        assert_eq!(config.relay.port, 9100);
        assert!(config.third_party.is_none());
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_advertise_ip_overrides_local_ip() {
        let mut config = ConfigManager::parse_toml(SAMPLE_TOML).unwrap();
        config.relay.advertise_ip = Some(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(config.relay.local_ip(), Ipv4Addr::new(192, 168, 1, 1));
    }
}
