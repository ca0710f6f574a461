//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Configuration for a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections the pool will open (default: 5).
    pub max_connections: u32,

    /// How long `checkout` waits for a free connection (default: 5s).
    pub checkout_timeout: Duration,

    /// Period for background reaping of abandoned connections.
    ///
    /// Must be `None`: abandoned connections are reclaimed synchronously at
    /// checkout time, and a timer-driven reaper has nothing to observe
    /// between two suspension points of a single thread.
    pub reaping_frequency: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            checkout_timeout: Duration::from_secs(5),
            reaping_frequency: None,
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `key=value;key=value` configuration string.
    ///
    /// Recognized keys (case-insensitive):
    ///
    /// ```text
    /// pool | max_connections = <count>
    /// checkout_timeout       = <seconds, fractional allowed>
    /// reaping_frequency      = <seconds>
    /// ```
    ///
    /// The result is not validated; [`validate`](Self::validate) still
    /// rejects a reaping frequency.
    pub fn from_config_string(config: &str) -> Result<Self, PoolError> {
        let mut parsed = Self::default();

        for part in config.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "pool" | "max_connections" => {
                    parsed.max_connections = value.parse().map_err(|_| {
                        PoolError::Config(format!("invalid pool size: {value}"))
                    })?;
                }
                "checkout_timeout" => {
                    parsed.checkout_timeout = parse_seconds(value)?;
                }
                "reaping_frequency" => {
                    parsed.reaping_frequency = Some(parse_seconds(value)?);
                }
                _ => {
                    tracing::debug!(key = key, value = value, "ignoring unknown pool option");
                }
            }
        }

        Ok(parsed)
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the checkout timeout.
    #[must_use]
    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    /// Set the reaping frequency. Any value makes the configuration invalid.
    #[must_use]
    pub fn reaping_frequency(mut self, frequency: Option<Duration>) -> Self {
        self.reaping_frequency = frequency;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if let Some(frequency) = self.reaping_frequency {
            return Err(PoolError::Config(format!(
                "reaping_frequency ({frequency:?}) is not supported; \
                 abandoned connections are reaped at checkout"
            )));
        }
        Ok(())
    }
}

fn parse_seconds(value: &str) -> Result<Duration, PoolError> {
    value
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| PoolError::Config(format!("invalid duration: {value}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.checkout_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_reaping_frequency() {
        let config = PoolConfig::new().reaping_frequency(Some(Duration::from_secs(60)));
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
        assert!(err.to_string().contains("reaping_frequency"));
    }

    #[test]
    fn test_rejects_empty_pool() {
        assert!(PoolConfig::new().max_connections(0).validate().is_err());
    }

    #[test]
    fn test_from_config_string() {
        let config =
            PoolConfig::from_config_string("pool=10; checkout_timeout=2.5; adapter=mysql")
                .unwrap();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.checkout_timeout, Duration::from_millis(2500));
        assert_eq!(config.reaping_frequency, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_config_string_reaping_is_invalid() {
        let config = PoolConfig::from_config_string("Max_Connections=3;reaping_frequency=60")
            .unwrap();
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.reaping_frequency, Some(Duration::from_secs(60)));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_config_string_errors() {
        assert!(PoolConfig::from_config_string("pool").is_err());
        assert!(PoolConfig::from_config_string("pool=many").is_err());
        assert!(PoolConfig::from_config_string("checkout_timeout=-1").is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_fills_missing_fields_with_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{"max_connections": 12}"#).unwrap();
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.checkout_timeout, Duration::from_secs(5));
        assert_eq!(config.reaping_frequency, None);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: PoolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
