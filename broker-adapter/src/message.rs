//! Message header carried alongside every payload

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default MIME type of published payloads
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Message header
///
/// Identifies the logical message type of a payload plus the metadata the
/// broker layer needs. Builder methods consume `self`; once handed to the
/// adapter a header is only read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Hierarchical message type name, e.g. `Orders::Created`
    pub message_class: String,

    /// Message ID (UUIDv7 for ordering)
    pub uuid: Uuid,

    /// Publish timestamp
    pub published_at: DateTime<Utc>,

    /// MIME type of the payload
    pub content_type: String,

    /// Adapter instance that published the message
    pub publisher_id: Option<Uuid>,

    /// Free-form string headers
    pub metadata: BTreeMap<String, String>,
}

impl MessageHeader {
    /// Create new header for a message type
    pub fn new(message_class: impl Into<String>) -> Self {
        Self {
            message_class: message_class.into(),
            uuid: Uuid::now_v7(),
            published_at: Utc::now(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            publisher_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Message type name
    pub fn message_class(&self) -> &str {
        &self.message_class
    }

    /// Set content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set publisher ID
    pub fn with_publisher(mut self, publisher_id: Uuid) -> Self {
        self.publisher_id = Some(publisher_id);
        self
    }

    /// Set message ID
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    /// Set publish timestamp
    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = published_at;
        self
    }

    /// Add metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether this header was published by the given adapter
    pub fn is_from(&self, publisher_id: Uuid) -> bool {
        self.publisher_id == Some(publisher_id)
    }
}
