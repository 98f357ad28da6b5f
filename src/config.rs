//! Relay configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_BODY_SIZE};

/// Default deadline for a forwarded call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the relay and its channel.
///
/// Durations are written in milliseconds when loaded from JSON; missing
/// fields take their defaults.
///
/// ```
/// use relaywire::RelayConfig;
///
/// let config = RelayConfig::from_json(r#"{ "call_timeout": 5000 }"#).unwrap();
/// assert_eq!(config.call_timeout.as_secs(), 5);
/// assert_eq!(config.read_buffer_size, 64 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long a call waits for the backend before it resolves to 500.
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
    /// Largest inbound frame body accepted before the channel is torn down.
    pub max_body_size: u32,
    /// Size of the receive loop's read buffer.
    pub read_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            read_buffer_size: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl RelayConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.max_body_size, 1024 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, 64 * 1024);
    }

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(RelayConfig::from_json("{}").unwrap(), RelayConfig::default());
    }

    #[test]
    fn test_partial_json() {
        let config = RelayConfig::from_json(r#"{"max_body_size": 4096}"#).unwrap();
        assert_eq!(config.max_body_size, 4096);
        assert_eq!(config.call_timeout, DEFAULT_CALL_TIMEOUT);
    }

    #[test]
    fn test_serialize_round_trip() {
        let config = RelayConfig {
            call_timeout: Duration::from_millis(1500),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"call_timeout\":1500"));
        assert_eq!(RelayConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_json() {
        let err = RelayConfig::from_json(r#"{"call_timeout": "soon"}"#).unwrap_err();
        assert!(matches!(err, RelayError::Json(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"read_buffer_size": 8192}}"#).unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.read_buffer_size, 8192);
    }
}
