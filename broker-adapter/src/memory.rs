//! In-process topic broker
//!
//! Implements the broker client traits without a network: topic exchanges,
//! durable queues, bindings with `*`/`#` patterns and one consumer per
//! queue. Keeps declaration counters and supports fault injection, which is
//! what the adapter tests drive it for.

use crate::{
    client::{Channel, Connection, Connector, Delivery, DeliveryStream, Exchange},
    message::MessageHeader,
    routing::{topic_matches, RoutingKey},
    types::{MessagePayload, QueueOptions},
    Error, Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Counters of broker-visible side effects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Connections opened
    pub connections_opened: usize,
    /// Queues created (re-declaring an existing queue does not count)
    pub queues_declared: usize,
    /// Bindings created (re-binding an identical pattern does not count)
    pub bindings_created: usize,
    /// Queue existence checks
    pub exists_checks: usize,
    /// Messages accepted by an exchange
    pub published: usize,
    /// Messages that matched no binding
    pub unroutable: usize,
}

#[derive(Default)]
struct Counters {
    connections_opened: AtomicUsize,
    queues_declared: AtomicUsize,
    bindings_created: AtomicUsize,
    exists_checks: AtomicUsize,
    published: AtomicUsize,
    unroutable: AtomicUsize,
}

#[derive(Default)]
struct Faults {
    connect: AtomicBool,
    queue_exists: AtomicBool,
    declare: AtomicBool,
    publish: AtomicBool,
    publish_countdown: AtomicU32,
    close_channel_on_error: AtomicBool,
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

struct QueueState {
    options: QueueOptions,
    backlog: VecDeque<Delivery>,
    consumer: Option<mpsc::UnboundedSender<Result<Delivery>>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: DashMap<String, ()>,
    queues: DashMap<String, QueueState>,
    bindings: RwLock<Vec<Binding>>,
    counters: Counters,
    faults: Faults,
}

/// In-process topic broker
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Create empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of side-effect counters
    pub fn stats(&self) -> BrokerStats {
        let c = &self.state.counters;
        BrokerStats {
            connections_opened: c.connections_opened.load(Ordering::SeqCst),
            queues_declared: c.queues_declared.load(Ordering::SeqCst),
            bindings_created: c.bindings_created.load(Ordering::SeqCst),
            exists_checks: c.exists_checks.load(Ordering::SeqCst),
            published: c.published.load(Ordering::SeqCst),
            unroutable: c.unroutable.load(Ordering::SeqCst),
        }
    }

    /// Whether an exchange was declared
    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.exchanges.contains_key(name)
    }

    /// Whether a queue was declared
    pub fn has_queue(&self, name: &str) -> bool {
        self.state.queues.contains_key(name)
    }

    /// Declaration options of a queue
    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state.queues.get(name).map(|q| q.options)
    }

    /// Messages waiting in a queue with no consumer attached
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.queues.get(name).map(|q| q.backlog.len())
    }

    /// Binding patterns of a queue
    pub fn bindings_for(&self, queue: &str) -> Vec<String> {
        self.state
            .bindings
            .read()
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.pattern.clone())
            .collect()
    }

    /// Fail every subsequent `connect`
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.faults.connect.store(fail, Ordering::SeqCst);
    }

    /// Fail every subsequent queue existence check
    pub fn set_fail_queue_exists(&self, fail: bool) {
        self.state.faults.queue_exists.store(fail, Ordering::SeqCst);
    }

    /// Fail every subsequent queue declaration
    pub fn set_fail_declare(&self, fail: bool) {
        self.state.faults.declare.store(fail, Ordering::SeqCst);
    }

    /// Fail every subsequent publish
    pub fn set_fail_publish(&self, fail: bool) {
        self.state.faults.publish.store(fail, Ordering::SeqCst);
    }

    /// Fail only the next `count` publishes
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.faults.publish_countdown.store(count, Ordering::SeqCst);
    }

    /// Close a channel whenever an operation on it fails, the way AMQP soft
    /// errors do
    pub fn set_close_channel_on_error(&self, close: bool) {
        self.state
            .faults
            .close_channel_on_error
            .store(close, Ordering::SeqCst);
    }

    fn publish_should_fail(&self) -> bool {
        let faults = &self.state.faults;
        if faults.publish.load(Ordering::SeqCst) {
            return true;
        }
        faults
            .publish_countdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn route(&self, exchange: &str, routing_key: &str, delivery: Delivery) {
        let targets: Vec<String> = {
            let bindings = self.state.bindings.read();
            let mut queues: Vec<String> = bindings
                .iter()
                .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
                .map(|b| b.queue.clone())
                .collect();
            queues.sort();
            queues.dedup();
            queues
        };

        if targets.is_empty() {
            self.state.counters.unroutable.fetch_add(1, Ordering::SeqCst);
            debug!("Unroutable message on {} with routing key {}", exchange, routing_key);
            return;
        }

        for queue in targets {
            if let Some(mut state) = self.state.queues.get_mut(&queue) {
                let delivered = match &state.consumer {
                    Some(tx) => tx.send(Ok(delivery.clone())).is_ok(),
                    None => false,
                };
                if !delivered {
                    state.consumer = None;
                    state.backlog.push_back(delivery.clone());
                }
            }
        }
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>> {
        if self.state.faults.connect.load(Ordering::SeqCst) {
            return Err(Error::Broker(format!("connection refused: {}", url)));
        }
        self.state
            .counters
            .connections_opened
            .fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryConnection {
            broker: self.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }))
    }
}

/// Connection to an [`InMemoryBroker`]
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        if !self.is_open() {
            return Err(Error::Broker("connection closed".to_string()));
        }
        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            connection_open: self.open.clone(),
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Channel on an [`InMemoryConnection`]
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
}

impl InMemoryChannel {
    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Broker("channel closed".to_string()))
        }
    }

    fn soft_error(&self, reason: String) -> Error {
        if self
            .state()
            .faults
            .close_channel_on_error
            .load(Ordering::SeqCst)
        {
            self.open.store(false, Ordering::SeqCst);
        }
        Error::Broker(reason)
    }

    fn state(&self) -> &BrokerState {
        &self.broker.state
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_topic_exchange(&self, name: &str) -> Result<Exchange> {
        self.check_open()?;
        self.state().exchanges.entry(name.to_string()).or_insert(());
        Ok(Exchange::new(name))
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        self.check_open()?;
        if self.state().faults.queue_exists.load(Ordering::SeqCst) {
            return Err(self.soft_error(format!("ACCESS_REFUSED - queue {}", queue)));
        }
        self.state()
            .counters
            .exists_checks
            .fetch_add(1, Ordering::SeqCst);
        Ok(self.state().queues.contains_key(queue))
    }

    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()> {
        self.check_open()?;
        if self.state().faults.declare.load(Ordering::SeqCst) {
            return Err(self.soft_error(format!("ACCESS_REFUSED - declare {}", queue)));
        }
        let mut created = false;
        self.state().queues.entry(queue.to_string()).or_insert_with(|| {
            created = true;
            QueueState {
                options,
                backlog: VecDeque::new(),
                consumer: None,
            }
        });
        if created {
            self.state()
                .counters
                .queues_declared
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &Exchange, pattern: &str) -> Result<()> {
        self.check_open()?;
        if !self.state().exchanges.contains_key(exchange.name()) {
            return Err(self.soft_error(format!("NOT_FOUND - exchange {}", exchange.name())));
        }
        if !self.state().queues.contains_key(queue) {
            return Err(self.soft_error(format!("NOT_FOUND - queue {}", queue)));
        }

        let mut bindings = self.state().bindings.write();
        let exists = bindings
            .iter()
            .any(|b| b.exchange == exchange.name() && b.queue == queue && b.pattern == pattern);
        if !exists {
            bindings.push(Binding {
                exchange: exchange.name().to_string(),
                queue: queue.to_string(),
                pattern: pattern.to_string(),
            });
            self.state()
                .counters
                .bindings_created
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &Exchange,
        routing_key: &RoutingKey,
        header: &MessageHeader,
        payload: &MessagePayload,
    ) -> Result<()> {
        self.check_open()?;
        if !self.state().exchanges.contains_key(exchange.name()) {
            return Err(self.soft_error(format!("NOT_FOUND - exchange {}", exchange.name())));
        }
        if self.broker.publish_should_fail() {
            return Err(self.soft_error("publish rejected".to_string()));
        }

        self.state().counters.published.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            routing_key: routing_key.to_string(),
            header: header.clone(),
            payload: payload.clone(),
        };
        self.broker.route(exchange.name(), routing_key.as_str(), delivery);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.check_open()?;
        let mut state = self
            .state()
            .queues
            .get_mut(queue)
            .ok_or_else(|| self.soft_error(format!("NOT_FOUND - queue {}", queue)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        for delivery in state.backlog.drain(..) {
            // Receiver is alive in this scope
            let _ = tx.send(Ok(delivery));
        }
        state.consumer = Some(tx);
        debug!("Consumer {} attached to queue {}", consumer_tag, queue);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }
}
