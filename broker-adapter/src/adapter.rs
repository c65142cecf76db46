//! Broker adapter: publish / receive / subscribe over a topic exchange

use crate::{
    client::{Channel, Connection, Connector, DeliveryStream, Exchange},
    config::AdapterConfig,
    dispatcher::{Dispatcher, HandlerRef, RouteReport},
    message::MessageHeader,
    metrics::{LOOPBACK_TOTAL, PUBLISH_DURATION, PUBLISH_TOTAL},
    routing::RoutingKey,
    topology::Provisioner,
    types::{AdapterState, MessagePayload},
    Error, Result,
};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pre-built broker handles, for injecting an already provisioned topology
#[derive(Clone)]
pub struct AdapterHandles {
    /// Open connection
    pub connection: Arc<dyn Connection>,
    /// Channel on that connection
    pub channel: Arc<dyn Channel>,
    /// Declared topic exchange
    pub exchange: Exchange,
}

fn transition(state: &mut AdapterState, next: AdapterState) -> Result<()> {
    if !state.can_transition_to(next) {
        return Err(Error::NotReady(*state));
    }
    debug!("Adapter state {} -> {}", state, next);
    *state = next;
    Ok(())
}

fn next_delay(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

/// Broker adapter
///
/// Maps publish/subscribe onto one connection, one channel and one shared
/// topic exchange. Subscriptions live in the injected [`Dispatcher`], which
/// may be shared with other adapters in the process.
pub struct BrokerAdapter {
    id: Uuid,
    config: AdapterConfig,
    state: RwLock<AdapterState>,
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    exchange: Exchange,
    provisioner: Provisioner,
    dispatcher: Arc<Dispatcher>,
    loopback: Arc<AtomicBool>,
    consumers: DashMap<RoutingKey, JoinHandle<()>>,
    consumer_start: tokio::sync::Mutex<()>,
    catch_all: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerAdapter {
    /// Connect to the broker and provision the shared topology.
    ///
    /// Opens a connection and a channel, declares the topic exchange, binds
    /// the catch-all queue and starts its logging consumer. Any failure is
    /// fatal: the adapter is only returned in the Ready state.
    pub async fn connect(
        config: AdapterConfig,
        connector: &dyn Connector,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        config.validate()?;

        let mut state = AdapterState::Uninitialized;
        transition(&mut state, AdapterState::Connecting)?;
        info!("Connecting broker adapter (exchange: {})", config.exchange_name);

        let handles = Self::open(&config, connector)
            .await
            .map_err(|e| Error::Connection(e.reason()))?;

        let adapter = Self::assemble(config, handles, dispatcher, state);

        if let Err(e) = adapter.provision_catch_all().await {
            error!("Failed to provision catch-all binding: {}", e);
            if let Err(close_err) = adapter.connection.close().await {
                warn!("Failed to close connection: {}", close_err);
            }
            return Err(Error::Connection(e.reason()));
        }

        transition(&mut adapter.state.write(), AdapterState::Ready)?;
        info!("Broker adapter {} ready", adapter.id);
        Ok(adapter)
    }

    /// Build an adapter around already established handles.
    ///
    /// The topology is assumed provisioned: no catch-all binding is declared
    /// and no broker call is made.
    pub fn from_handles(
        config: AdapterConfig,
        handles: AdapterHandles,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        config.validate()?;

        let adapter = Self::assemble(config, handles, dispatcher, AdapterState::Uninitialized);
        transition(&mut adapter.state.write(), AdapterState::Ready)?;
        info!("Broker adapter {} ready (injected handles)", adapter.id);
        Ok(adapter)
    }

    async fn open(config: &AdapterConfig, connector: &dyn Connector) -> Result<AdapterHandles> {
        let connection = connector.connect(&config.broker_url).await?;
        let channel = connection.create_channel().await?;
        let exchange = channel.declare_topic_exchange(&config.exchange_name).await?;
        Ok(AdapterHandles {
            connection,
            channel,
            exchange,
        })
    }

    fn assemble(
        config: AdapterConfig,
        handles: AdapterHandles,
        dispatcher: Arc<Dispatcher>,
        state: AdapterState,
    ) -> Self {
        let provisioner = Provisioner::new(handles.connection.clone(), handles.exchange.clone());
        Self {
            id: Uuid::new_v4(),
            loopback: Arc::new(AtomicBool::new(config.loopback)),
            config,
            state: RwLock::new(state),
            connection: handles.connection,
            channel: handles.channel,
            exchange: handles.exchange,
            provisioner,
            dispatcher,
            consumers: DashMap::new(),
            consumer_start: tokio::sync::Mutex::new(()),
            catch_all: Mutex::new(None),
        }
    }

    async fn provision_catch_all(&self) -> Result<()> {
        let queue = self.config.default_queue.clone();
        self.provisioner
            .provision_catch_all(&queue, &self.config.catch_all_pattern())
            .await?;

        let stream = self
            .channel
            .consume(&queue, &format!("{}.catch-all", self.id))
            .await?;
        *self.catch_all.lock() = Some(tokio::spawn(log_deliveries(stream, queue)));
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match *self.state.read() {
            AdapterState::Ready => Ok(()),
            other => Err(Error::NotReady(other)),
        }
    }

    /// Publish a payload under the routing key derived from the header.
    ///
    /// Provisions the key's queue binding on first use. The outgoing copy is
    /// stamped with this adapter's ID, replacing any publisher ID the caller
    /// set. With loopback on, the caller's header is also dispatched locally
    /// before this returns.
    pub async fn publish(&self, header: &MessageHeader, payload: &MessagePayload) -> Result<()> {
        self.ensure_ready()?;

        let routing_key = RoutingKey::validated(header.message_class())?;
        self.provisioner.ensure_binding(&routing_key).await?;

        let outgoing = header.clone().with_publisher(self.id);

        let start = Instant::now();
        let result = self.publish_with_retry(&routing_key, &outgoing, payload).await;

        let status = if result.is_ok() { "success" } else { "error" };
        PUBLISH_DURATION
            .with_label_values(&[status])
            .observe(start.elapsed().as_secs_f64());
        PUBLISH_TOTAL.with_label_values(&[status]).inc();
        result?;

        if self.loopback() {
            LOOPBACK_TOTAL.inc();
            self.receive(header, payload).await;
        }
        Ok(())
    }

    /// Publish with exponential backoff retry
    async fn publish_with_retry(
        &self,
        routing_key: &RoutingKey,
        header: &MessageHeader,
        payload: &MessagePayload,
    ) -> Result<()> {
        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempts = 0;
        let mut delay = retry.initial_delay();

        loop {
            attempts += 1;

            match self
                .channel
                .publish(&self.exchange, routing_key, header, payload)
                .await
            {
                Ok(()) => {
                    if attempts > 1 {
                        info!("Message {} published after {} attempts", header.uuid, attempts);
                    }
                    return Ok(());
                }
                Err(e) => {
                    if attempts >= max_attempts {
                        error!(
                            "Failed to publish {} to {} after {} attempts: {}",
                            header.uuid, routing_key, attempts, e
                        );
                        return Err(Error::Publish {
                            routing_key: routing_key.to_string(),
                            reason: e.reason(),
                        });
                    }

                    warn!(
                        "Publish to {} failed (attempt {}), retrying in {:?}: {}",
                        routing_key, attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay, retry.max_delay());
                }
            }
        }
    }

    /// Dispatch a delivery to local handlers
    pub async fn receive(&self, header: &MessageHeader, payload: &MessagePayload) -> RouteReport {
        self.dispatcher.route(header, payload).await
    }

    /// Register a handler for a message type.
    ///
    /// Only touches the dispatcher unless `consume_on_subscribe` is set. In
    /// that default mode the type's queue exists only once something has
    /// published it, so a subscriber without a matching publisher never
    /// receives network deliveries. With `consume_on_subscribe`, the binding
    /// is provisioned here and a consumer feeds the queue into dispatch.
    ///
    /// Returns false if the handler was already registered for the type.
    pub async fn subscribe(&self, message_type: &str, handler: HandlerRef) -> Result<bool> {
        if self.config.consume_on_subscribe {
            self.ensure_ready()?;
            let routing_key = RoutingKey::validated(message_type)?;
            self.provisioner.ensure_binding(&routing_key).await?;
            self.start_consumer(&routing_key).await?;
        }
        Ok(self.dispatcher.add(message_type, handler))
    }

    /// Remove one handler of a message type
    pub fn unsubscribe(&self, message_type: &str, handler: &HandlerRef) -> bool {
        self.dispatcher.remove(message_type, handler)
    }

    /// Remove every handler of a message type.
    ///
    /// This adapter's consumer for the type's routing key is stopped once no
    /// subscribed type derives that key any more.
    pub fn unsubscribe_all(&self, message_type: &str) -> usize {
        let removed = self.dispatcher.remove_all(message_type);

        let routing_key = RoutingKey::derive(message_type);
        let key_in_use = self
            .dispatcher
            .message_types()
            .iter()
            .any(|other| RoutingKey::derive(other) == routing_key);
        if !key_in_use {
            if let Some((_, consumer)) = self.consumers.remove(&routing_key) {
                consumer.abort();
                debug!("Stopped consumer on {}", routing_key);
            }
        }
        removed
    }

    async fn start_consumer(&self, routing_key: &RoutingKey) -> Result<()> {
        let _guard = self.consumer_start.lock().await;
        if self.consumers.contains_key(routing_key) {
            return Ok(());
        }

        let tag = format!("{}.{}", self.id, routing_key);
        let stream = self
            .channel
            .consume(routing_key.as_str(), &tag)
            .await
            .map_err(|e| Error::Subscribe(format!("{}: {}", routing_key, e.reason())))?;

        let consumer = tokio::spawn(dispatch_deliveries(
            stream,
            self.dispatcher.clone(),
            self.loopback.clone(),
            self.id,
            routing_key.to_string(),
        ));
        self.consumers.insert(routing_key.clone(), consumer);
        info!("Consuming {} for adapter {}", routing_key, self.id);
        Ok(())
    }

    /// Whether published messages are looped back locally
    pub fn loopback(&self) -> bool {
        self.loopback.load(Ordering::SeqCst)
    }

    /// Toggle loopback for subsequent publishes
    pub fn set_loopback(&self, loopback: bool) {
        self.loopback.store(loopback, Ordering::SeqCst);
    }

    /// Stop consumers, close the connection and move to Closed
    pub async fn close(&self) -> Result<()> {
        transition(&mut self.state.write(), AdapterState::Closed)?;
        self.stop_consumers();

        self.connection
            .close()
            .await
            .map_err(|e| Error::Connection(e.reason()))?;
        info!("Broker adapter {} closed", self.id);
        Ok(())
    }

    fn stop_consumers(&self) {
        self.consumers.retain(|_, consumer| {
            consumer.abort();
            false
        });
        if let Some(catch_all) = self.catch_all.lock().take() {
            catch_all.abort();
        }
    }

    /// Adapter instance ID, stamped on published headers
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> AdapterState {
        *self.state.read()
    }

    /// Configuration
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Broker connection
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Broker channel
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Shared topic exchange
    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// Shared dispatcher
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Topology provisioner
    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Routing keys this adapter is consuming
    pub fn consuming(&self) -> Vec<RoutingKey> {
        let mut keys: Vec<RoutingKey> = self.consumers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl Drop for BrokerAdapter {
    fn drop(&mut self) {
        self.stop_consumers();
    }
}

/// Feed a queue's deliveries into the dispatcher.
///
/// Messages this adapter published while loopback is on were already
/// dispatched locally and are skipped.
async fn dispatch_deliveries(
    mut stream: DeliveryStream,
    dispatcher: Arc<Dispatcher>,
    loopback: Arc<AtomicBool>,
    adapter_id: Uuid,
    queue: String,
) {
    while let Some(delivery) = stream.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                error!("Consumer on {} failed: {}", queue, e);
                break;
            }
        };

        if loopback.load(Ordering::SeqCst) && delivery.header.is_from(adapter_id) {
            debug!("Skipping {} on {}: already looped back", delivery.header.uuid, queue);
            continue;
        }

        let report = dispatcher.route(&delivery.header, &delivery.payload).await;
        if report.is_unmatched() {
            debug!("No handlers for {} on {}", report.message_type, queue);
        }
    }
    debug!("Consumer on {} stopped", queue);
}

/// Log catch-all deliveries. Performs no dispatch.
async fn log_deliveries(mut stream: DeliveryStream, queue: String) {
    while let Some(delivery) = stream.next().await {
        match delivery {
            Ok(delivery) => info!(
                "Generic message with routing key {} on {} ({} bytes)",
                delivery.routing_key,
                queue,
                delivery.payload.len()
            ),
            Err(e) => {
                warn!("Catch-all consumer on {} failed: {}", queue, e);
                break;
            }
        }
    }
}
