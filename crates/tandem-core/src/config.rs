//! Connection configuration.
//!
//! `RpcConfig` holds crate-wide constants; `ConnectionConfig` is the
//! per-connection, serde-loadable configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol-level constants.
pub struct RpcConfig;

impl RpcConfig {
    /// Negative means "wait forever".
    pub const DEFAULT_RESPONSE_TIMEOUT_MS: i64 = -1;
    /// Upper bound on how long disposal waits for in-flight dispatch tasks.
    pub const DISPOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_COMMAND_NAME_LEN: usize = 256;
}

/// How long a call waits for its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseTimeout {
    /// Fail before the command is even sent.
    Immediate,
    After(Duration),
    Infinite,
}

impl ResponseTimeout {
    /// Interpret a millisecond setting: `0` is immediate, negative is infinite.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => ResponseTimeout::Immediate,
            ms if ms < 0 => ResponseTimeout::Infinite,
            ms => ResponseTimeout::After(Duration::from_millis(ms as u64)),
        }
    }

    /// The duration reported in timeout errors.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            ResponseTimeout::Immediate => Some(Duration::ZERO),
            ResponseTimeout::After(d) => Some(*d),
            ResponseTimeout::Infinite => None,
        }
    }
}

/// Per-connection configuration.
///
/// # Example
///
/// ```
/// use tandem_core::config::ConnectionConfig;
///
/// let config = ConnectionConfig::new()
///     .with_response_timeout_ms(2_000)
///     .with_id_seed(1);
/// assert_eq!(config.response_timeout_ms, 2_000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Response timeout in milliseconds (`0` = immediate, negative = infinite).
    pub response_timeout_ms: i64,
    /// How long disposal waits for in-flight dispatch tasks to finish.
    pub dispose_drain_timeout_ms: u64,
    /// Fixed starting packet id. `None` seeds randomly.
    pub id_seed: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: RpcConfig::DEFAULT_RESPONSE_TIMEOUT_MS,
            dispose_drain_timeout_ms: RpcConfig::DISPOSE_DRAIN_TIMEOUT.as_millis() as u64,
            id_seed: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the response timeout in milliseconds.
    pub fn with_response_timeout_ms(mut self, ms: i64) -> Self {
        self.response_timeout_ms = ms;
        self
    }

    /// Set the disposal drain timeout.
    pub fn with_dispose_drain_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Start packet ids at a fixed value.
    pub fn with_id_seed(mut self, seed: u64) -> Self {
        self.id_seed = Some(seed);
        self
    }

    pub fn response_timeout(&self) -> ResponseTimeout {
        ResponseTimeout::from_millis(self.response_timeout_ms)
    }

    pub fn dispose_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.dispose_drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_timeout_from_millis() {
        assert_eq!(ResponseTimeout::from_millis(0), ResponseTimeout::Immediate);
        assert_eq!(ResponseTimeout::from_millis(-1), ResponseTimeout::Infinite);
        assert_eq!(ResponseTimeout::from_millis(-500), ResponseTimeout::Infinite);
        assert_eq!(
            ResponseTimeout::from_millis(200),
            ResponseTimeout::After(Duration::from_millis(200))
        );
    }

    #[test]
    fn test_default_timeout_is_infinite() {
        let config = ConnectionConfig::default();
        assert_eq!(config.response_timeout(), ResponseTimeout::Infinite);
        assert_eq!(config.dispose_drain_timeout(), RpcConfig::DISPOSE_DRAIN_TIMEOUT);
        assert!(config.id_seed.is_none());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = ConnectionConfig::from_json_str(r#"{"response_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.response_timeout_ms, 250);
        assert_eq!(
            config.dispose_drain_timeout_ms,
            ConnectionConfig::default().dispose_drain_timeout_ms
        );
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let result = ConnectionConfig::from_json_str("not json");
        assert!(matches!(result, Err(crate::error::RpcError::Json { .. })));
    }
}
