//! Configuration (out-of-scope loader contract): a sectioned
//! file read at startup, plus a separate vendor-credentials file loaded
//! through `dotenv`. `toml`-backed with `#[serde(default)]` per field so a
//! partial file still parses to sane values; TOML's `[section]` syntax
//! covers the sectioned-file requirement without a dedicated INI parser.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub fix_session: FixSessionConfig,
    #[serde(default)]
    pub timing_wheel: TimingWheelConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            fix_session: FixSessionConfig::default(),
            timing_wheel: TimingWheelConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Reads `GATEWAY_CONFIG_PATH`, falling back to `gateway.toml`, and to
    /// built-in defaults if neither parses.
    pub fn from_env() -> Self {
        let path = std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| "gateway.toml".to_string());
        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("using default gateway config ({}): {}", path, e);
            Self::default()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
}

fn default_port() -> u16 {
    5201
}
fn default_worker_count() -> usize {
    4
}
fn default_listen_backlog() -> i32 {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            worker_count: default_worker_count(),
            listen_backlog: default_listen_backlog(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default = "default_heart_bt_int")]
    pub default_heart_bt_int: i64,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_heart_bt_int() -> i64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_port: default_port(),
            default_heart_bt_int: default_heart_bt_int(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixSessionConfig {
    #[serde(default = "default_min_heart_bt_int")]
    pub min_heart_bt_int: i64,
    #[serde(default = "default_max_heart_bt_int")]
    pub max_heart_bt_int: i64,
    #[serde(default = "default_logout_timeout_secs")]
    pub logout_timeout_secs: i64,
    #[serde(default = "default_test_req_timeout_secs")]
    pub test_request_timeout_secs: i64,
}

fn default_min_heart_bt_int() -> i64 {
    10
}
fn default_max_heart_bt_int() -> i64 {
    60
}
fn default_logout_timeout_secs() -> i64 {
    5
}
fn default_test_req_timeout_secs() -> i64 {
    10
}

impl Default for FixSessionConfig {
    fn default() -> Self {
        Self {
            min_heart_bt_int: default_min_heart_bt_int(),
            max_heart_bt_int: default_max_heart_bt_int(),
            logout_timeout_secs: default_logout_timeout_secs(),
            test_request_timeout_secs: default_test_req_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingWheelConfig {
    #[serde(default = "default_wheel_slots")]
    pub slots: usize,
    #[serde(default = "default_wheel_tick_ms")]
    pub tick_interval_ms: i64,
}

fn default_wheel_slots() -> usize {
    512
}
fn default_wheel_tick_ms() -> i64 {
    100
}

impl Default for TimingWheelConfig {
    fn default() -> Self {
        Self {
            slots: default_wheel_slots(),
            tick_interval_ms: default_wheel_tick_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default = "default_max_body_length")]
    pub max_body_length: usize,
}

fn default_max_buffer_size() -> usize {
    1 << 20
}
fn default_max_body_length() -> usize {
    1 << 16
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            max_body_length: default_max_body_length(),
        }
    }
}

/// Vendor market-data/trader credentials, loaded separately from the main
/// config via `dotenv` so secrets never sit in the checked-in TOML file.
#[derive(Debug, Clone, Default)]
pub struct VendorCredentials {
    pub md_username: Option<String>,
    pub md_password: Option<String>,
    pub trader_username: Option<String>,
    pub trader_password: Option<String>,
}

impl VendorCredentials {
    pub fn from_env_file(path: impl AsRef<Path>) -> Self {
        let _ = dotenv::from_path(path.as_ref());
        Self {
            md_username: std::env::var("GATEWAY_MD_USERNAME").ok(),
            md_password: std::env::var("GATEWAY_MD_PASSWORD").ok(),
            trader_username: std::env::var("GATEWAY_TRADER_USERNAME").ok(),
            trader_password: std::env::var("GATEWAY_TRADER_PASSWORD").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = Config::default();
        assert_eq!(config.server.port, 5201);
        assert!(config.fix_session.max_heart_bt_int > config.fix_session.min_heart_bt_int);
    }

    #[test]
    fn parses_partial_toml_with_defaults_filled_in() {
        let toml = r#"
            [server]
            port = 7000
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.worker_count, 4);
        assert_eq!(config.timing_wheel.slots, 512);
    }
}
