//! Broker client interface
//!
//! The adapter never speaks the wire protocol itself. These traits are the
//! seam to whichever client owns connections, channels and framing:
//! [`crate::amqp`] for RabbitMQ, [`crate::memory`] for an in-process broker.

use crate::{
    message::MessageHeader,
    routing::RoutingKey,
    types::{MessagePayload, QueueOptions},
    Result,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Handle to a declared topic exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Exchange {
    name: String,
}

impl Exchange {
    /// Create handle for an exchange name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Exchange name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Inbound message delivered by the broker
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Routing key the message was published under
    pub routing_key: String,
    /// Decoded header
    pub header: MessageHeader,
    /// Payload
    pub payload: MessagePayload,
}

/// Stream of deliveries from one queue
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Opens broker connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to the broker at `url`
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>>;
}

/// Live broker connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a channel on this connection
    async fn create_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;
}

/// Channel on a broker connection
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare (or retrieve) a durable topic exchange
    async fn declare_topic_exchange(&self, name: &str) -> Result<Exchange>;

    /// Whether a queue with this name exists
    async fn queue_exists(&self, queue: &str) -> Result<bool>;

    /// Declare a queue
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()>;

    /// Bind a queue to an exchange under a binding pattern
    async fn bind_queue(&self, queue: &str, exchange: &Exchange, pattern: &str) -> Result<()>;

    /// Publish a payload to an exchange under a routing key
    async fn publish(
        &self,
        exchange: &Exchange,
        routing_key: &RoutingKey,
        header: &MessageHeader,
        payload: &MessagePayload,
    ) -> Result<()>;

    /// Start consuming a queue
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Close the channel
    async fn close(&self) -> Result<()>;

    /// Whether the channel is still usable. A broker-side soft error closes
    /// the channel it happened on.
    fn is_open(&self) -> bool;
}
