//! Broker adapter for RabbitMQ-style topic exchanges
//!
//! Maps an application's publish/subscribe calls onto a message broker:
//! - One shared topic exchange per adapter
//! - Routing keys derived from message type names
//! - Durable per-type queues provisioned on first publish
//! - Process-wide handler registry with local loopback dispatch
//! - Publish retry with exponential backoff
//! - Observability via Prometheus metrics
//!
//! The broker itself sits behind the [`client`] traits: [`AmqpConnector`]
//! talks to RabbitMQ through lapin, [`InMemoryBroker`] runs in process.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod adapter;
pub mod amqp;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod routing;
pub mod topology;
pub mod types;

pub use adapter::{AdapterHandles, BrokerAdapter};
pub use amqp::AmqpConnector;
pub use config::{AdapterConfig, RetryConfig};
pub use dispatcher::{handler_fn, Dispatcher, HandlerRef, MessageHandler, RouteReport};
pub use error::{Error, Result};
pub use memory::InMemoryBroker;
pub use message::MessageHeader;
pub use routing::{derive_routing_key, RoutingKey};
pub use types::{AdapterState, MessagePayload, QueueOptions};
