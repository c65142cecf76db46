//! RabbitMQ (AMQP 0.9.1) broker client built on lapin
//!
//! Every broker round trip is bounded by the configured operation timeout.
//! Channels run in publisher confirm mode, so a publish only succeeds once
//! the broker has acked it.
//! The message header travels in the AMQP basic properties: `type` carries
//! the message class, `message_id` the UUID, `timestamp` the publish time in
//! unix seconds, and the header table carries metadata plus the publisher ID.

use crate::{
    client::{Channel, Connection, Connector, Delivery, DeliveryStream, Exchange},
    config::AdapterConfig,
    message::MessageHeader,
    routing::RoutingKey,
    types::{MessagePayload, QueueOptions},
    Error, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, ConnectionProperties, ExchangeKind,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header table key carrying the publishing adapter's ID
pub const PUBLISHER_ID_HEADER: &str = "x-publisher-id";

/// Persistent delivery mode
const PERSISTENT: u8 = 2;

/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;

async fn bounded<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = lapin::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            millis: timeout.as_millis() as u64,
        }),
    }
}

/// Opens lapin connections
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    timeout: Duration,
}

impl AmqpConnector {
    /// Create connector with an operation timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Create connector from adapter configuration
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self::new(config.operation_timeout())
    }
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self::from_config(&AdapterConfig::default())
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>> {
        info!("Connecting to AMQP broker");
        let connection = bounded(
            self.timeout,
            "connection.open",
            lapin::Connection::connect(url, ConnectionProperties::default()),
        )
        .await?;

        Ok(Arc::new(AmqpConnection {
            inner: Arc::new(connection),
            timeout: self.timeout,
        }))
    }
}

/// lapin connection
pub struct AmqpConnection {
    inner: Arc<lapin::Connection>,
    timeout: Duration,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = bounded(self.timeout, "channel.open", self.inner.create_channel()).await?;
        bounded(
            self.timeout,
            "confirm.select",
            channel.confirm_select(ConfirmSelectOptions::default()),
        )
        .await?;
        Ok(Arc::new(AmqpChannel {
            connection: self.inner.clone(),
            channel,
            timeout: self.timeout,
        }))
    }

    async fn close(&self) -> Result<()> {
        bounded(
            self.timeout,
            "connection.close",
            self.inner.close(REPLY_SUCCESS, "OK"),
        )
        .await
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

/// lapin channel
pub struct AmqpChannel {
    connection: Arc<lapin::Connection>,
    channel: lapin::Channel,
    timeout: Duration,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_topic_exchange(&self, name: &str) -> Result<Exchange> {
        bounded(
            self.timeout,
            "exchange.declare",
            self.channel.exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            ),
        )
        .await?;
        Ok(Exchange::new(name))
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        // A failed passive declare closes its channel, so probe on a scratch one
        let probe = bounded(self.timeout, "channel.open", self.connection.create_channel()).await?;

        let declared = tokio::time::timeout(
            self.timeout,
            probe.queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            ),
        )
        .await;

        // NOT_FOUND already closed it
        if probe.status().connected() {
            let closed = bounded(
                self.timeout,
                "channel.close",
                probe.close(REPLY_SUCCESS, "OK"),
            )
            .await;
            if let Err(e) = closed {
                debug!("Failed to close probe channel: {}", e);
            }
        }

        match declared {
            Err(_) => Err(Error::Timeout {
                operation: "queue.declare(passive)".to_string(),
                millis: self.timeout.as_millis() as u64,
            }),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(lapin::Error::ProtocolError(e)))
                if matches!(e.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)) =>
            {
                Ok(false)
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()> {
        bounded(
            self.timeout,
            "queue.declare",
            self.channel.queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            ),
        )
        .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &Exchange, pattern: &str) -> Result<()> {
        bounded(
            self.timeout,
            "queue.bind",
            self.channel.queue_bind(
                queue,
                exchange.name(),
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            ),
        )
        .await
    }

    async fn publish(
        &self,
        exchange: &Exchange,
        routing_key: &RoutingKey,
        header: &MessageHeader,
        payload: &MessagePayload,
    ) -> Result<()> {
        let confirm = bounded(
            self.timeout,
            "basic.publish",
            self.channel.basic_publish(
                exchange.name(),
                routing_key.as_str(),
                BasicPublishOptions::default(),
                payload.as_ref(),
                properties_for(header),
            ),
        )
        .await?;

        let confirmation = bounded(self.timeout, "basic.publish(confirm)", confirm).await?;
        check_confirmation(routing_key, confirmation)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = bounded(
            self.timeout,
            "basic.consume",
            self.channel.basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            ),
        )
        .await?;

        Ok(consumer
            .map(|delivery| {
                delivery.map_err(Error::from).map(|d| {
                    let routing_key = d.routing_key.as_str().to_string();
                    Delivery {
                        header: header_from_properties(&routing_key, &d.properties),
                        routing_key,
                        payload: Bytes::from(d.data),
                    }
                })
            })
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        bounded(
            self.timeout,
            "channel.close",
            self.channel.close(REPLY_SUCCESS, "OK"),
        )
        .await
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

fn check_confirmation(routing_key: &RoutingKey, confirmation: Confirmation) -> Result<()> {
    match confirmation {
        Confirmation::Nack(_) => Err(Error::Broker(format!(
            "publish to {} nacked by broker",
            routing_key
        ))),
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}

/// Encode a header into AMQP basic properties
pub fn properties_for(header: &MessageHeader) -> BasicProperties {
    let mut table = FieldTable::default();
    for (key, value) in &header.metadata {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    if let Some(publisher_id) = header.publisher_id {
        table.insert(
            ShortString::from(PUBLISHER_ID_HEADER),
            AMQPValue::LongString(LongString::from(publisher_id.to_string())),
        );
    }

    BasicProperties::default()
        .with_type(ShortString::from(header.message_class.clone()))
        .with_message_id(ShortString::from(header.uuid.to_string()))
        .with_timestamp(header.published_at.timestamp().max(0) as u64)
        .with_content_type(ShortString::from(header.content_type.clone()))
        .with_delivery_mode(PERSISTENT)
        .with_headers(table)
}

/// Decode a header from AMQP basic properties.
///
/// Messages published by other clients may lack any of the properties; the
/// routing key stands in for a missing message class.
pub fn header_from_properties(routing_key: &str, properties: &BasicProperties) -> MessageHeader {
    let message_class = properties
        .kind()
        .as_ref()
        .map(|kind| kind.as_str().to_string())
        .unwrap_or_else(|| routing_key.to_string());

    let mut header = MessageHeader::new(message_class);

    if let Some(id) = properties.message_id() {
        match Uuid::parse_str(id.as_str()) {
            Ok(uuid) => header = header.with_uuid(uuid),
            Err(_) => warn!("Ignoring non-UUID message_id {:?}", id.as_str()),
        }
    }

    if let Some(published_at) = properties
        .timestamp()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
    {
        header = header.with_published_at(published_at);
    }

    if let Some(content_type) = properties.content_type() {
        header = header.with_content_type(content_type.as_str());
    }

    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            let Some(value) = field_as_string(value) else {
                continue;
            };
            if key.as_str() == PUBLISHER_ID_HEADER {
                if let Ok(publisher_id) = Uuid::parse_str(&value) {
                    header = header.with_publisher(publisher_id);
                }
            } else {
                header = header.with_metadata(key.as_str(), value);
            }
        }
    }

    header
}

fn field_as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}
