//! Client configuration.
//!
//! [`ClientConfig`] is the construction-time surface. [`ConfigFile`] is its
//! JSON form with millisecond fields, used by the CLI.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};
use crate::version::VersionRange;

/// Network whose bundled server catalogue is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Testnet => write!(f, "testnet"),
        }
    }
}

impl std::str::FromStr for Network {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" | "chipnet" => Ok(Self::Testnet),
            other => Err(RpcError::InvalidConfig(format!("unknown network '{other}'"))),
        }
    }
}

/// Reconnection backoff policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Attempts per reconnection episode. `<= 0` retries forever.
    pub max_attempts: i32,
    /// Delay before the first attempt; doubles per attempt.
    pub base_delay: Duration,
    /// Cap on the un-jittered delay.
    pub max_delay: Duration,
    /// Inclusive multiplier range the jitter factor is drawn from.
    pub jitter_range: (f64, f64),
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(1_500),
            max_delay: Duration::from_secs(30),
            jitter_range: (0.9, 1.1),
        }
    }
}

/// Liveness pings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Time between pings.
    pub interval: Duration,
    /// Timeout applied to each ping.
    pub timeout: Duration,
    /// Consecutive misses tolerated before reconnecting.
    pub tolerance: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            tolerance: 2,
        }
    }
}

/// Configuration for the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    /// Timeout for opening one socket.
    pub connection_timeout: Duration,
    /// Largest inbound message accepted, in bytes.
    pub maximum_message_size: usize,
    /// Protocol versions this client speaks.
    pub protocol_version_range: VersionRange,
    /// Explicit servers, tried before the bundled catalogue.
    pub bootstrap_servers: Option<Vec<String>>,
    pub network: Network,
    /// Name sent in the `server.version` handshake.
    pub client_name: String,
    /// Reconnect by itself after an unexpected disconnect.
    pub automatic_reconnect: bool,
    /// Also fetch `server.features` during negotiation.
    pub fetch_server_features: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            connection_timeout: Duration::from_secs(10),
            maximum_message_size: 64 << 20,
            protocol_version_range: VersionRange::default(),
            bootstrap_servers: None,
            network: Network::Mainnet,
            client_name: concat!("electrumrpc/", env!("CARGO_PKG_VERSION")).into(),
            automatic_reconnect: true,
            fetch_server_features: false,
        }
    }
}

impl ClientConfig {
    /// Config targeting one explicit server.
    pub fn for_server(url: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: Some(vec![url.into()]),
            ..Default::default()
        }
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        let r = &self.reconnect;
        if r.base_delay > r.max_delay {
            return Err(RpcError::InvalidConfig(format!(
                "reconnect base delay {:?} exceeds max delay {:?}",
                r.base_delay, r.max_delay
            )));
        }
        let (lo, hi) = r.jitter_range;
        if !(lo > 0.0 && lo <= hi && hi.is_finite()) {
            return Err(RpcError::InvalidConfig(format!(
                "invalid jitter range ({lo}, {hi})"
            )));
        }
        let v = &self.protocol_version_range;
        if v.min > v.max {
            return Err(RpcError::InvalidConfig(format!(
                "protocol version range {v} is inverted"
            )));
        }
        if self.maximum_message_size == 0 {
            return Err(RpcError::InvalidConfig("maximum message size is zero".into()));
        }
        if self.heartbeat.enabled && self.heartbeat.interval.is_zero() {
            return Err(RpcError::InvalidConfig("heartbeat interval is zero".into()));
        }
        Ok(())
    }
}

// ─── File form ────────────────────────────────────────────────────────────────

/// JSON configuration file. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub reconnect: ReconnectFile,
    #[serde(default)]
    pub heartbeat: HeartbeatFile,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_maximum_message_size")]
    pub maximum_message_size: usize,
    #[serde(default)]
    pub protocol_version_range: VersionRange,
    #[serde(default)]
    pub bootstrap_servers: Option<Vec<String>>,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default = "bool_true")]
    pub automatic_reconnect: bool,
    #[serde(default)]
    pub fetch_server_features: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectFile {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_range")]
    pub jitter_range: (f64, f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatFile {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_heartbeat_tolerance")]
    pub tolerance: u32,
}

fn default_connection_timeout_ms() -> u64 { 10_000 }
fn default_maximum_message_size() -> usize { 64 << 20 }
fn default_max_attempts() -> i32 { 8 }
fn default_base_delay_ms() -> u64 { 1_500 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_jitter_range() -> (f64, f64) { (0.9, 1.1) }
fn default_heartbeat_interval_ms() -> u64 { 30_000 }
fn default_heartbeat_timeout_ms() -> u64 { 10_000 }
fn default_heartbeat_tolerance() -> u32 { 2 }
fn bool_true() -> bool { true }

impl Default for ReconnectFile {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_range: default_jitter_range(),
        }
    }
}

impl Default for HeartbeatFile {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
            tolerance: default_heartbeat_tolerance(),
        }
    }
}

impl ConfigFile {
    /// Parse a JSON config document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RpcError::InvalidConfig(e.to_string()))
    }

    /// Convert into a validated [`ClientConfig`].
    pub fn into_config(self) -> Result<ClientConfig> {
        let defaults = ClientConfig::default();
        let config = ClientConfig {
            reconnect: ReconnectConfig {
                max_attempts: self.reconnect.max_attempts,
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                jitter_range: self.reconnect.jitter_range,
            },
            heartbeat: HeartbeatConfig {
                enabled: self.heartbeat.enabled,
                interval: Duration::from_millis(self.heartbeat.interval_ms),
                timeout: Duration::from_millis(self.heartbeat.timeout_ms),
                tolerance: self.heartbeat.tolerance,
            },
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            maximum_message_size: self.maximum_message_size,
            protocol_version_range: self.protocol_version_range,
            bootstrap_servers: self.bootstrap_servers,
            network: self.network,
            client_name: self.client_name.unwrap_or(defaults.client_name),
            automatic_reconnect: self.automatic_reconnect,
            fetch_server_features: self.fetch_server_features,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = ConfigFile::from_json("{}").unwrap().into_config().unwrap();
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(1_500));
        assert_eq!(config.network, Network::Mainnet);
        assert!(config.automatic_reconnect);
    }

    #[test]
    fn file_overrides() {
        let json = r#"{
            "reconnect": { "max_attempts": 0, "base_delay_ms": 100, "max_delay_ms": 1000, "jitter_range": [1.0, 1.0] },
            "network": "testnet",
            "bootstrap_servers": ["wss://example.org:50004"],
            "protocol_version_range": { "min": "1.4", "max": "1.5" }
        }"#;
        let config = ConfigFile::from_json(json).unwrap().into_config().unwrap();
        assert_eq!(config.reconnect.max_attempts, 0);
        assert_eq!(config.reconnect.jitter_range, (1.0, 1.0));
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.protocol_version_range.max.to_string(), "1.5");
    }

    #[test]
    fn rejects_inverted_delays() {
        let mut config = ClientConfig::default();
        config.reconnect.base_delay = Duration::from_secs(60);
        assert!(matches!(config.validate(), Err(RpcError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_bad_jitter() {
        let mut config = ClientConfig::default();
        config.reconnect.jitter_range = (1.2, 0.8);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_network() {
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::Testnet);
        assert!("regtest".parse::<Network>().is_err());
    }
}
