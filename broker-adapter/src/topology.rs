//! On-demand queue provisioning
//!
//! Each routing key gets one durable queue of the same name, bound to the
//! shared topic exchange under the key itself. Keys already bound during
//! this provisioner's lifetime are cached, so the broker is asked at most
//! once per key.
//!
//! Provisioning runs on a scratch channel opened for the attempt. A failed
//! declare or bind closes the channel it ran on, which must never be the
//! adapter's publishing channel.

use crate::{
    client::{Channel, Connection, Exchange},
    metrics::BINDINGS_PROVISIONED_TOTAL,
    routing::RoutingKey,
    types::QueueOptions,
    Error, Result,
};
use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Topology provisioner
pub struct Provisioner {
    connection: Arc<dyn Connection>,
    exchange: Exchange,
    known: DashSet<RoutingKey>,
    provisioning: Mutex<()>,
}

impl Provisioner {
    /// Create provisioner on a connection and exchange
    pub fn new(connection: Arc<dyn Connection>, exchange: Exchange) -> Self {
        Self {
            connection,
            exchange,
            known: DashSet::new(),
            provisioning: Mutex::new(()),
        }
    }

    /// Exchange bindings are created on
    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// Whether the key is known to be bound
    pub fn is_known(&self, routing_key: &RoutingKey) -> bool {
        self.known.contains(routing_key)
    }

    /// Number of keys known to be bound
    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// Ensure a durable queue named after the key exists and is bound to the
    /// exchange under that key. Idempotent.
    pub async fn ensure_binding(&self, routing_key: &RoutingKey) -> Result<()> {
        if self.known.contains(routing_key) {
            return Ok(());
        }

        // Serialize slow-path provisioning so concurrent publishers of a new
        // key do not race check-then-create
        let _guard = self.provisioning.lock().await;
        if self.known.contains(routing_key) {
            return Ok(());
        }

        self.provision(routing_key).await.map_err(|e| {
            error!("Failed to provision binding for {}: {}", routing_key, e);
            Error::Provisioning {
                routing_key: routing_key.to_string(),
                reason: e.reason(),
            }
        })?;

        self.known.insert(routing_key.clone());
        Ok(())
    }

    async fn provision(&self, routing_key: &RoutingKey) -> Result<()> {
        let queue = routing_key.as_str();
        let channel = self.connection.create_channel().await?;

        let result = async {
            if channel.queue_exists(queue).await? {
                debug!("Queue {} already exists", queue);
                return Ok(false);
            }
            channel.declare_queue(queue, QueueOptions::durable()).await?;
            channel.bind_queue(queue, &self.exchange, queue).await?;
            Ok::<_, Error>(true)
        }
        .await;
        close_scratch(channel.as_ref()).await;

        if result? {
            BINDINGS_PROVISIONED_TOTAL.inc();
            info!("Bound queue {} to {}", queue, self.exchange.name());
        }
        Ok(())
    }

    /// Declare the catch-all queue and bind it under a wildcard pattern
    pub async fn provision_catch_all(&self, queue: &str, pattern: &str) -> Result<()> {
        let provision = async {
            let channel = self.connection.create_channel().await?;
            let result = async {
                channel.declare_queue(queue, QueueOptions::durable()).await?;
                channel.bind_queue(queue, &self.exchange, pattern).await
            }
            .await;
            close_scratch(channel.as_ref()).await;
            result
        };

        provision.await.map_err(|e| Error::Provisioning {
            routing_key: pattern.to_string(),
            reason: e.reason(),
        })?;

        info!(
            "Bound catch-all queue {} to {} under {}",
            queue,
            self.exchange.name(),
            pattern
        );
        Ok(())
    }
}

async fn close_scratch(channel: &dyn Channel) {
    if !channel.is_open() {
        return;
    }
    if let Err(e) = channel.close().await {
        warn!("Failed to close provisioning channel: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Connector;
    use crate::memory::InMemoryBroker;

    async fn provisioner(broker: &InMemoryBroker) -> Provisioner {
        let connection = broker.connect("memory://").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let exchange = channel.declare_topic_exchange("SmartMessage").await.unwrap();
        Provisioner::new(connection, exchange)
    }

    #[tokio::test]
    async fn test_ensure_binding_twice_creates_once() {
        let broker = InMemoryBroker::new();
        let provisioner = provisioner(&broker).await;
        let key = RoutingKey::derive("Orders::Created");

        provisioner.ensure_binding(&key).await.unwrap();
        provisioner.ensure_binding(&key).await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.queues_declared, 1);
        assert_eq!(stats.bindings_created, 1);
        assert_eq!(stats.exists_checks, 1);
        assert!(provisioner.is_known(&key));
        assert_eq!(broker.bindings_for("Orders.Created"), vec!["Orders.Created".to_string()]);
        assert_eq!(broker.queue_options("Orders.Created"), Some(QueueOptions::durable()));
    }

    #[tokio::test]
    async fn test_existing_queue_not_redeclared() {
        let broker = InMemoryBroker::new();
        let first = provisioner(&broker).await;
        let second = provisioner(&broker).await;
        let key = RoutingKey::derive("Orders::Created");

        first.ensure_binding(&key).await.unwrap();
        second.ensure_binding(&key).await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.queues_declared, 1);
        assert_eq!(stats.bindings_created, 1);
        assert_eq!(stats.exists_checks, 2);
        assert!(second.is_known(&key));
    }

    #[tokio::test]
    async fn test_concurrent_ensure_binding() {
        let broker = InMemoryBroker::new();
        let provisioner = Arc::new(provisioner(&broker).await);
        let key = RoutingKey::derive("Orders::Created");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let provisioner = provisioner.clone();
                let key = key.clone();
                tokio::spawn(async move { provisioner.ensure_binding(&key).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(broker.stats().exists_checks, 1);
        assert_eq!(broker.stats().queues_declared, 1);
        assert_eq!(provisioner.known_count(), 1);
    }

    #[tokio::test]
    async fn test_check_failure_is_provisioning_error() {
        let broker = InMemoryBroker::new();
        let provisioner = provisioner(&broker).await;
        let key = RoutingKey::derive("Orders::Created");

        broker.set_fail_queue_exists(true);
        let err = provisioner.ensure_binding(&key).await.unwrap_err();

        match err {
            Error::Provisioning { routing_key, .. } => assert_eq!(routing_key, "Orders.Created"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!provisioner.is_known(&key));

        // Not cached on failure, so a later attempt goes back to the broker
        broker.set_fail_queue_exists(false);
        provisioner.ensure_binding(&key).await.unwrap();
        assert!(provisioner.is_known(&key));
    }

    #[tokio::test]
    async fn test_declare_failure_is_provisioning_error() {
        let broker = InMemoryBroker::new();
        let provisioner = provisioner(&broker).await;

        broker.set_fail_declare(true);
        let result = provisioner
            .ensure_binding(&RoutingKey::derive("Orders::Created"))
            .await;

        assert!(matches!(result, Err(Error::Provisioning { .. })));
        assert!(!broker.has_queue("Orders.Created"));
    }

    #[tokio::test]
    async fn test_catch_all() {
        let broker = InMemoryBroker::new();
        let provisioner = provisioner(&broker).await;

        provisioner
            .provision_catch_all("default", "SmartMessage.#")
            .await
            .unwrap();

        assert!(broker.has_queue("default"));
        assert_eq!(broker.bindings_for("default"), vec!["SmartMessage.#".to_string()]);
        assert_eq!(provisioner.exchange().name(), "SmartMessage");
        assert_eq!(provisioner.known_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_later_attempts() {
        let broker = InMemoryBroker::new();
        let provisioner = provisioner(&broker).await;
        let key = RoutingKey::derive("Orders::Created");

        broker.set_close_channel_on_error(true);
        broker.set_fail_declare(true);
        assert!(provisioner.ensure_binding(&key).await.is_err());

        broker.set_fail_declare(false);
        provisioner.ensure_binding(&key).await.unwrap();
        assert!(broker.has_queue("Orders.Created"));
    }
}
