//! Client configuration

use crate::{ConfigError, FreshetResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default floor for the wake-timer delay, in milliseconds.
pub const DEFAULT_MIN_UPDATE_DELAY_MS: u64 = 10;
/// Default ceiling for the wake-timer delay, in milliseconds.
pub const DEFAULT_MAX_UPDATE_DELAY_MS: u64 = 60_000;
/// Default fetch timeout when no declaration bounds it, in milliseconds.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Tuning knobs for the client orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Smallest delay the wake timer is ever scheduled with.
    /// Keeps an already past-due resource from busy-looping the scheduler.
    pub min_update_delay: Duration,
    /// Largest delay the wake timer is ever scheduled with.
    pub max_update_delay: Duration,
    /// Timeout applied to fetches of resources whose aggregate timeout is unbounded.
    pub default_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            min_update_delay: Duration::from_millis(DEFAULT_MIN_UPDATE_DELAY_MS),
            max_update_delay: Duration::from_millis(DEFAULT_MAX_UPDATE_DELAY_MS),
            default_timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
        }
    }
}

impl ClientConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `FRESHET_MIN_UPDATE_DELAY_MS`: wake-timer floor (default: 10)
    /// - `FRESHET_MAX_UPDATE_DELAY_MS`: wake-timer ceiling (default: 60000)
    /// - `FRESHET_DEFAULT_TIMEOUT_MS`: fallback fetch timeout (default: 30000)
    pub fn from_env() -> Self {
        let min_update_delay = Duration::from_millis(
            std::env::var("FRESHET_MIN_UPDATE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MIN_UPDATE_DELAY_MS),
        );

        let max_update_delay = Duration::from_millis(
            std::env::var("FRESHET_MAX_UPDATE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_UPDATE_DELAY_MS),
        );

        let default_timeout = Duration::from_millis(
            std::env::var("FRESHET_DEFAULT_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_FETCH_TIMEOUT_MS),
        );

        Self {
            min_update_delay,
            max_update_delay,
            default_timeout,
        }
    }

    /// Set the wake-timer floor.
    pub fn with_min_update_delay(mut self, delay: Duration) -> Self {
        self.min_update_delay = delay;
        self
    }

    /// Set the wake-timer ceiling.
    pub fn with_max_update_delay(mut self, delay: Duration) -> Self {
        self.max_update_delay = delay;
        self
    }

    /// Set the fallback fetch timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Clamp a computed delay into `[min_update_delay, max_update_delay]`.
    pub fn clamp_delay(&self, delay: Duration) -> Duration {
        delay.clamp(self.min_update_delay, self.max_update_delay)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - all durations are positive
    /// - min_update_delay <= max_update_delay
    pub fn validate(&self) -> FreshetResult<()> {
        for (field, value) in [
            ("min_update_delay", self.min_update_delay),
            ("max_update_delay", self.max_update_delay),
            ("default_timeout", self.default_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: format!("{:?}", value),
                    reason: format!("{} must be positive", field),
                }
                .into());
            }
        }

        if self.min_update_delay > self.max_update_delay {
            return Err(ConfigError::InvalidValue {
                field: "min_update_delay".to_string(),
                value: format!("{:?}", self.min_update_delay),
                reason: format!(
                    "min_update_delay must not exceed max_update_delay ({:?})",
                    self.max_update_delay
                ),
            }
            .into());
        }

        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FreshetError;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_update_delay, Duration::from_millis(10));
        assert_eq!(config.max_update_delay, Duration::from_secs(60));
        assert_eq!(config.default_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new()
            .with_min_update_delay(Duration::from_millis(5))
            .with_max_update_delay(Duration::from_secs(5))
            .with_default_timeout(Duration::from_secs(2));

        assert_eq!(config.min_update_delay, Duration::from_millis(5));
        assert_eq!(config.max_update_delay, Duration::from_secs(5));
        assert_eq!(config.default_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_zero_delay_is_rejected() {
        let config = ClientConfig::new().with_min_update_delay(Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            FreshetError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "min_update_delay"
        ));
    }

    #[test]
    fn test_inverted_bounds_are_rejected() {
        let config = ClientConfig::new()
            .with_min_update_delay(Duration::from_secs(10))
            .with_max_update_delay(Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clamp_delay() {
        let config = ClientConfig::default();
        assert_eq!(config.clamp_delay(Duration::ZERO), config.min_update_delay);
        assert_eq!(config.clamp_delay(Duration::MAX), config.max_update_delay);
        assert_eq!(
            config.clamp_delay(Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
