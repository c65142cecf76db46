//! Error types for the broker adapter

use crate::types::AdapterState;
use thiserror::Error;

/// Broker adapter error
#[derive(Debug, Error)]
pub enum Error {
    /// Connection, channel or exchange could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// Queue existence check, declaration or binding failed during publish
    #[error("Provisioning error for routing key {routing_key}: {reason}")]
    Provisioning {
        /// Routing key being provisioned
        routing_key: String,
        /// Underlying failure
        reason: String,
    },

    /// Exchange-level publish failed after provisioning succeeded
    #[error("Publish error for routing key {routing_key}: {reason}")]
    Publish {
        /// Routing key of the failed publish
        routing_key: String,
        /// Underlying failure
        reason: String,
    },

    /// Message type name collapses to an empty or delimiter-only routing key
    #[error("Invalid routing key derived from {0:?}")]
    RoutingKey(String),

    /// Consumer could not be attached to a queue
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Raw failure reported by the broker client
    #[error("Broker error: {0}")]
    Broker(String),

    /// Broker operation exceeded its time bound
    #[error("Timeout after {millis}ms: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Bound in milliseconds
        millis: u64,
    },

    /// Adapter is not in the Ready state
    #[error("Adapter not ready (state: {0})")]
    NotReady(AdapterState),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Human readable reason, without the variant prefix for wrapped broker errors
    pub(crate) fn reason(&self) -> String {
        match self {
            Error::Broker(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Error::Broker(err.to_string())
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
