//! Core configuration
//!
//! The options recognised by the protocol engine. Parsing a configuration
//! file is the front-end's job; the engine takes this struct ready-made.

use crate::error::{Result, TorError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the protocol engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    /// Size of the primary guard set
    pub num_entry_guards: usize,

    /// Total time allowed to build a full circuit
    #[serde(with = "duration_secs")]
    pub circuit_build_timeout: Duration,

    /// Circuits older than this are not handed to new streams
    #[serde(with = "duration_secs")]
    pub max_circuit_dirtiness: Duration,

    /// Proactive circuit rotation interval
    #[serde(with = "duration_secs")]
    pub new_circuit_period: Duration,

    /// Ring minimum per isolation key
    pub circuit_pool_min: usize,

    /// Ring maximum per isolation key
    pub circuit_pool_max: usize,

    /// Sliding window size for replay detection
    pub replay_window: usize,

    /// Initial circuit package window
    pub circuit_package_window: u16,

    /// Initial circuit deliver window (increment 100, threshold 900)
    pub circuit_deliver_window: u16,

    /// Per-stream package window
    pub stream_package_window: u16,

    /// Per-stream deliver window (increment 50, threshold 450)
    pub stream_deliver_window: u16,

    /// Default stream isolation policy
    pub isolation_mode: IsolationMode,

    /// Per-HSDir descriptor fetch budget
    #[serde(with = "duration_secs")]
    pub hsdir_fetch_timeout: Duration,

    /// Data directory for persisted state (guards, descriptor cache)
    pub data_dir: PathBuf,
}

/// How streams are isolated onto circuits by default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Share circuits freely
    #[default]
    None,
    /// One isolation group per (host, port) destination
    Destination,
    /// One isolation group per SOCKS credential
    Credential,
    /// One isolation group per destination port
    Port,
    /// One isolation group per caller-supplied session token
    Session,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            num_entry_guards: 3,
            circuit_build_timeout: Duration::from_secs(60),
            max_circuit_dirtiness: Duration::from_secs(10 * 60),
            new_circuit_period: Duration::from_secs(30),
            circuit_pool_min: 2,
            circuit_pool_max: 10,
            replay_window: 32,
            circuit_package_window: 1000,
            circuit_deliver_window: 1000,
            stream_package_window: 500,
            stream_deliver_window: 500,
            isolation_mode: IsolationMode::None,
            hsdir_fetch_timeout: Duration::from_secs(5),
            data_dir: PathBuf::from(".tor-core"),
        }
    }
}

impl TorConfig {
    /// Validate option ranges.
    ///
    /// A zero window or an inverted pool bound would wedge the engine at
    /// runtime, so they are rejected up front.
    pub fn validate(&self) -> Result<()> {
        if self.num_entry_guards == 0 {
            return Err(TorError::InvalidConfig(
                "num_entry_guards must be at least 1".into(),
            ));
        }
        if self.circuit_pool_min > self.circuit_pool_max {
            return Err(TorError::InvalidConfig(format!(
                "circuit_pool_min ({}) exceeds circuit_pool_max ({})",
                self.circuit_pool_min, self.circuit_pool_max
            )));
        }
        if self.replay_window == 0 {
            return Err(TorError::InvalidConfig(
                "replay_window must be at least 1".into(),
            ));
        }
        if self.circuit_package_window == 0 || self.circuit_deliver_window == 0 {
            return Err(TorError::InvalidConfig(
                "circuit windows must be non-zero".into(),
            ));
        }
        if self.stream_package_window == 0 || self.stream_deliver_window == 0 {
            return Err(TorError::InvalidConfig(
                "stream windows must be non-zero".into(),
            ));
        }
        if self.circuit_build_timeout.is_zero() {
            return Err(TorError::InvalidConfig(
                "circuit_build_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Serialize durations as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = TorConfig::default();
        assert_eq!(config.num_entry_guards, 3);
        assert_eq!(config.circuit_build_timeout, Duration::from_secs(60));
        assert_eq!(config.max_circuit_dirtiness, Duration::from_secs(600));
        assert_eq!(config.circuit_pool_min, 2);
        assert_eq!(config.circuit_pool_max, 10);
        assert_eq!(config.replay_window, 32);
        assert_eq!(config.circuit_package_window, 1000);
        assert_eq!(config.stream_package_window, 500);
        assert_eq!(config.isolation_mode, IsolationMode::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = TorConfig::default();
        config.circuit_pool_min = 20;
        assert!(config.validate().is_err());

        let mut config = TorConfig::default();
        config.replay_window = 0;
        assert!(config.validate().is_err());

        let mut config = TorConfig::default();
        config.stream_package_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = TorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: TorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.num_entry_guards, config.num_entry_guards);
        assert_eq!(parsed.circuit_build_timeout, config.circuit_build_timeout);
        assert_eq!(parsed.isolation_mode, config.isolation_mode);
    }
}
