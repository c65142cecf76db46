//! Type definitions for the broker adapter

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque serialized message body. Never inspected by the adapter.
pub type MessagePayload = bytes::Bytes;

/// Adapter connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterState {
    /// Nothing opened yet
    Uninitialized,
    /// Opening connection, channel and exchange
    Connecting,
    /// Connection, channel and exchange established
    Ready,
    /// Connection closed by `close()`
    Closed,
}

impl AdapterState {
    /// Whether `next` is a legal transition from this state
    pub fn can_transition_to(self, next: AdapterState) -> bool {
        matches!(
            (self, next),
            (AdapterState::Uninitialized, AdapterState::Connecting)
                | (AdapterState::Uninitialized, AdapterState::Ready)
                | (AdapterState::Connecting, AdapterState::Ready)
                | (AdapterState::Ready, AdapterState::Closed)
        )
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::Uninitialized => "uninitialized",
            AdapterState::Connecting => "connecting",
            AdapterState::Ready => "ready",
            AdapterState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Queue declaration options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Survive broker restarts
    pub durable: bool,
    /// Delete once the last consumer goes away
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, non-auto-deleting queue
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::durable()
    }
}
