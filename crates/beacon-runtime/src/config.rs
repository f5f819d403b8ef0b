//! Node configuration
//!
//! Built from defaults, optionally replaced by a JSON document, then
//! adjusted by `BEACON_*` environment variables. Durations are written in
//! humantime form ("30s", "500ms").

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use beacon_registry::{EvictionConfig, EvictionStrategy, DEFAULT_EVICTION_TIMEOUT};
use beacon_replication::{
    ReplicationConfig, DEFAULT_ACK_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_RECONNECT_DELAY, HEARTBEAT_MISSES,
};

pub const ENV_NODE_ID: &str = "BEACON_NODE_ID";
pub const ENV_EVICTION_TIMEOUT: &str = "BEACON_EVICTION_TIMEOUT";
pub const ENV_RECONNECT_DELAY: &str = "BEACON_RECONNECT_DELAY";
pub const ENV_ACK_TIMEOUT: &str = "BEACON_ACK_TIMEOUT";
pub const ENV_HEARTBEAT_INTERVAL: &str = "BEACON_HEARTBEAT_INTERVAL";
pub const ENV_LOG_FORMAT: &str = "BEACON_LOG_FORMAT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid duration {value:?} for {key}: {reason}")]
    InvalidDuration {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Unknown log format: {0}")]
    InvalidLogFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::InvalidLogFormat(s.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Registry node configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity announced in replication handshakes
    pub node_id: String,
    /// Address accepting replication channels from peers
    pub replication_addr: SocketAddr,
    /// Address accepting client registration channels
    pub registration_addr: SocketAddr,
    /// Peers replicated to from startup
    pub peers: Vec<SocketAddr>,
    #[serde(with = "duration_text")]
    pub eviction_timeout: Duration,
    /// Largest tolerated shrink below the expected registry size, in
    /// percent; `None` evicts without limit
    pub self_preservation_percent: Option<u8>,
    #[serde(with = "duration_text")]
    pub reconnect_delay: Duration,
    #[serde(with = "duration_text")]
    pub ack_timeout: Duration,
    #[serde(with = "duration_text")]
    pub handshake_timeout: Duration,
    /// Expected client heartbeat period
    #[serde(with = "duration_text")]
    pub heartbeat_interval: Duration,
    pub log_format: LogFormat,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: "beacon-node".to_string(),
            replication_addr: SocketAddr::from(([127, 0, 0, 1], 7001)),
            registration_addr: SocketAddr::from(([127, 0, 0, 1], 7002)),
            peers: Vec::new(),
            eviction_timeout: DEFAULT_EVICTION_TIMEOUT,
            self_preservation_percent: Some(20),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            log_format: LogFormat::Pretty,
        }
    }
}

impl NodeConfig {
    /// Parse a JSON document; absent fields keep their defaults
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(document)?;
        config.validate()
    }

    /// Apply `BEACON_*` overrides from the process environment
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(node_id) = lookup(ENV_NODE_ID) {
            self.node_id = node_id;
        }
        if let Some(value) = lookup(ENV_EVICTION_TIMEOUT) {
            self.eviction_timeout = parse_duration(ENV_EVICTION_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_RECONNECT_DELAY) {
            self.reconnect_delay = parse_duration(ENV_RECONNECT_DELAY, &value)?;
        }
        if let Some(value) = lookup(ENV_ACK_TIMEOUT) {
            self.ack_timeout = parse_duration(ENV_ACK_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_HEARTBEAT_INTERVAL) {
            self.heartbeat_interval = parse_duration(ENV_HEARTBEAT_INTERVAL, &value)?;
        }
        if let Some(value) = lookup(ENV_LOG_FORMAT) {
            self.log_format = value.parse()?;
        }
        self.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".into()));
        }
        if self.replication_addr == self.registration_addr {
            return Err(ConfigError::Invalid(format!(
                "replication and registration share {}",
                self.replication_addr
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat_interval must not be zero".into()));
        }
        if self.self_preservation_percent.is_some_and(|p| p > 100) {
            return Err(ConfigError::Invalid(
                "self_preservation_percent must be at most 100".into(),
            ));
        }
        Ok(self)
    }

    pub fn eviction(&self) -> EvictionConfig {
        EvictionConfig {
            timeout: self.eviction_timeout,
            strategy: match self.self_preservation_percent {
                Some(percent) => EvictionStrategy::PercentageDrop(percent),
                None => EvictionStrategy::Unlimited,
            },
        }
    }

    /// Silence after which a registration is treated as vanished
    pub fn lease_duration(&self) -> Duration {
        self.heartbeat_interval * HEARTBEAT_MISSES
    }

    pub fn replication(&self) -> ReplicationConfig {
        ReplicationConfig {
            reconnect_delay: self.reconnect_delay,
            ack_timeout: self.ack_timeout,
            handshake_timeout: self.handshake_timeout,
        }
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::InvalidDuration {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

mod duration_text {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(de::Error::custom)
    }
}
