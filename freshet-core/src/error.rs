//! Error types for freshet operations
//!
//! Only configuration and registry problems are ever returned as `Err`.
//! Fetch failures and timeouts are values ([`FetchError`]) recorded in
//! resource state.

use crate::ConsumerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No handler registered for mandatory operation: {operation}")]
    MissingOperation { operation: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unknown mutation: {name}")]
    UnknownMutation { name: String },

    #[error("Unknown selector: {name}")]
    UnknownSelector { name: String },

    #[error("Unknown method: {verb}")]
    UnknownMethod { verb: String },
}

/// Consumer registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Consumer not registered: {consumer}")]
    UnknownConsumer { consumer: ConsumerId },
}

/// Master error type for all freshet errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FreshetError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Result type alias for freshet operations.
pub type FreshetResult<T> = Result<T, FreshetError>;

/// Failure of a single fetch attempt.
///
/// This is data, not control flow: it is stored in the resource state and
/// reported through the `error_received` hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct FetchError {
    pub message: String,
    /// Host-supplied failure payload, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// The synthetic error produced when a fetch outlives its timeout.
    ///
    /// The timeout is rendered in whole milliseconds, truncated, so a
    /// sub-millisecond timeout reads `"Timeout of 0 reached."`.
    pub fn timeout(timeout: Duration) -> Self {
        Self::new(format!("Timeout of {} reached.", timeout.as_millis()))
    }

    pub fn is_timeout(&self) -> bool {
        self.message.starts_with("Timeout of ") && self.message.ends_with(" reached.")
    }
}

// =============================================================================
// TESTS
// =============================================================================
