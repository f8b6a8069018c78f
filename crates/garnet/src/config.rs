//! Peer configuration: recognized options, defaults, TOML loading and
//! validation.

use crate::reliability::LayerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Protocol revision spoken by this build; handshakes with a different
/// version are rejected.
pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// All recognized tuning options. Every field has a sensible default, so
/// `Config::default()` is a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Size of the peer table.
    pub max_connections: usize,
    /// Maximum datagram size in bytes, 576..=1500.
    pub mtu: u16,
    /// Silence threshold for dead-peer detection.
    pub timeout_ms: u64,
    /// Keepalive ping cadence while a connection is otherwise idle.
    pub ping_interval_ms: u64,
    /// Retransmission attempts before a peer is declared lost.
    pub max_send_attempts: u32,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
    /// ACK coalescing window.
    pub ack_delay_ms: u64,
    /// Concurrent split-packet reassembly records per peer.
    pub max_split_packets_per_peer: usize,
    /// Reassembly memory cap per peer, in bytes.
    pub max_reassembly_bytes_per_peer: usize,
    /// Optional shared secret checked during the handshake.
    pub password: Option<String>,
    /// Payload echoed in unconnected pong replies.
    pub advertisement: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 64,
            mtu: 1492,
            timeout_ms: 10_000,
            ping_interval_ms: 5_000,
            max_send_attempts: 10,
            min_rto_ms: 100,
            max_rto_ms: 3_000,
            ack_delay_ms: 5,
            max_split_packets_per_peer: 64,
            max_reassembly_bytes_per_peer: 8 * 1024 * 1024,
            password: None,
            advertisement: String::new(),
        }
    }
}

impl Config {
    /// Reads a TOML configuration file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be positive".into(),
            ));
        }
        if !(576..=1500).contains(&self.mtu) {
            return Err(ConfigError::Validation(format!(
                "mtu {} outside 576..=1500",
                self.mtu
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation("timeout_ms must be positive".into()));
        }
        if self.max_send_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_send_attempts must be positive".into(),
            ));
        }
        if self.min_rto_ms == 0 || self.min_rto_ms > self.max_rto_ms {
            return Err(ConfigError::Validation(format!(
                "rto range {}..{} is invalid",
                self.min_rto_ms, self.max_rto_ms
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// The per-session reliability tuning this config implies, at the
    /// session's negotiated MTU.
    pub fn layer_config(&self, mtu: u16) -> LayerConfig {
        LayerConfig {
            mtu: mtu as usize,
            min_rto: Duration::from_millis(self.min_rto_ms),
            max_rto: Duration::from_millis(self.max_rto_ms),
            ack_delay: Duration::from_millis(self.ack_delay_ms),
            max_send_attempts: self.max_send_attempts,
            max_split_records: self.max_split_packets_per_peer,
            max_reassembly_bytes: self.max_reassembly_bytes_per_peer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn mtu_bounds_enforced() {
        let mut config = Config {
            mtu: 575,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        config.mtu = 1501;
        assert!(config.validate().is_err());
        config.mtu = 576;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rto_range_enforced() {
        let config = Config {
            min_rto_ms: 500,
            max_rto_ms: 100,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let text = toml::to_string(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.mtu, 1492);
        assert_eq!(parsed.timeout_ms, 10_000);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let parsed: Config = toml::from_str("mtu = 1200\n").unwrap();
        assert_eq!(parsed.mtu, 1200);
        assert_eq!(parsed.ack_delay_ms, 5);
    }
}
