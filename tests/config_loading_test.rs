//! Configuration file loading tests

use anyhow::Result;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tempfile::TempDir;
use transit::config::ConfigManager;

#[test]
fn test_load_toml_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("transit.toml");
    fs::write(
        &config_path,
        r#"
third_party = "10.0.0.3:9000"

[relay]
bind_ip = "0.0.0.0"
advertise_ip = "10.0.0.9"
port = 7001
dial_timeout = "5s"
shutdown_timeout = "10s"
max_sessions = 256

[peers]
downstream = "10.0.0.1"
upstream = "10.0.0.2"

[logging]
level = "debug"
"#,
    )?;

    let config = ConfigManager::load_from_file(&config_path)?;

    assert_eq!(config.relay.bind_addr(), "0.0.0.0:7001".parse::<SocketAddr>()?);
    assert_eq!(config.relay.local_ip(), Ipv4Addr::new(10, 0, 0, 9));
    assert_eq!(config.relay.dial_timeout, Duration::from_secs(5));
    assert_eq!(config.relay.shutdown_timeout, Duration::from_secs(10));
    assert_eq!(config.relay.max_sessions, Some(256));
    assert_eq!(config.peers.downstream, "10.0.0.1".parse::<IpAddr>()?);
    assert_eq!(config.logging.level, "debug");

    Ok(())
}

#[test]
fn test_load_legacy_json_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("transit.json");
    fs::write(
        &config_path,
        r#"{"IPArray": ["10.0.0.1", "10.0.0.2"], "ThirdPartyAddr": "10.0.0.3:9000", "IP": "10.0.0.9", "Port": 7001}"#,
    )?;

    let config = ConfigManager::load_from_file(&config_path)?;

    assert_eq!(config.relay.bind_addr(), "10.0.0.9:7001".parse::<SocketAddr>()?);
    assert_eq!(config.peers.upstream, "10.0.0.2".parse::<IpAddr>()?);
    assert_eq!(config.third_party.as_deref(), Some("10.0.0.3:9000"));

    Ok(())
}

#[test]
fn test_missing_file_is_error() {
    let temp_dir = TempDir::new().unwrap();
    let result = ConfigManager::load_from_file(&temp_dir.path().join("absent.toml"));
    assert!(result.is_err());
}

#[test]
fn test_invalid_file_is_error() -> Result<()> {
    let temp_dir = TempDir::new()?;

    let garbled = temp_dir.path().join("garbled.toml");
    fs::write(&garbled, "[relay\nport = ")?;
    assert!(ConfigManager::load_from_file(&garbled).is_err());

    let same_peers = temp_dir.path().join("same.json");
    fs::write(
        &same_peers,
        r#"{"IPArray": ["10.0.0.1", "10.0.0.1"], "ThirdPartyAddr": "", "IP": "10.0.0.9", "Port": 7001}"#,
    )?;
    let err = ConfigManager::load_from_file(&same_peers).unwrap_err();
    assert!(format!("{:#}", err).contains("must differ"));

    Ok(())
}
