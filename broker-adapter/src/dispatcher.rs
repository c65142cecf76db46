//! Subscription registry and local message routing
//!
//! One [`Dispatcher`] is shared (through `Arc`) by every adapter in a
//! process, so all of them see the same subscriptions. Handlers are kept per
//! message type in registration order; a handler is identified by the
//! `Arc` it was registered with.

use crate::{
    message::MessageHeader,
    metrics::{HANDLER_FAILURES_TOTAL, ROUTE_TOTAL},
    types::MessagePayload,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Message handler trait
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a delivered message
    async fn handle(&self, header: &MessageHeader, payload: &MessagePayload) -> anyhow::Result<()>;

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Shared handler reference
pub type HandlerRef = Arc<dyn MessageHandler>;

/// Handler backed by a closure, see [`handler_fn`]
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageHeader, MessagePayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, header: &MessageHeader, payload: &MessagePayload) -> anyhow::Result<()> {
        (self.f)(header.clone(), payload.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap a closure as a handler
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> HandlerRef
where
    F: Fn(MessageHeader, MessagePayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// Outcome of routing one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReport {
    /// Message type routed
    pub message_type: String,
    /// Handlers invoked
    pub invoked: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

impl RouteReport {
    /// No handler was registered for the type
    pub fn is_unmatched(&self) -> bool {
        self.invoked == 0
    }

    /// Every invoked handler succeeded
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Message type → handlers registry
#[derive(Default)]
pub struct Dispatcher {
    subscriptions: DashMap<String, Vec<HandlerRef>>,
}

impl Dispatcher {
    /// Create empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Create empty dispatcher ready to be shared
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a handler. Returns false if it was already registered.
    pub fn add(&self, message_type: &str, handler: HandlerRef) -> bool {
        let mut handlers = self
            .subscriptions
            .entry(message_type.to_string())
            .or_default();

        if handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }

        debug!("Subscribed {} to {}", handler.name(), message_type);
        handlers.push(handler);
        true
    }

    /// Remove one handler. Returns false if it was not registered.
    pub fn remove(&self, message_type: &str, handler: &HandlerRef) -> bool {
        let removed = match self.subscriptions.get_mut(message_type) {
            Some(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|h| !Arc::ptr_eq(h, handler));
                before != handlers.len()
            }
            None => false,
        };

        self.subscriptions
            .remove_if(message_type, |_, handlers| handlers.is_empty());

        if removed {
            debug!("Unsubscribed {} from {}", handler.name(), message_type);
        }
        removed
    }

    /// Remove every handler of a message type. Returns how many were removed.
    pub fn remove_all(&self, message_type: &str) -> usize {
        let removed = self
            .subscriptions
            .remove(message_type)
            .map(|(_, handlers)| handlers.len())
            .unwrap_or(0);

        if removed > 0 {
            debug!("Unsubscribed all {} handlers from {}", removed, message_type);
        }
        removed
    }

    /// Handlers registered for a message type
    pub fn handler_count(&self, message_type: &str) -> usize {
        self.subscriptions
            .get(message_type)
            .map(|handlers| handlers.len())
            .unwrap_or(0)
    }

    /// Whether any handler is registered for a message type
    pub fn is_subscribed(&self, message_type: &str) -> bool {
        self.handler_count(message_type) > 0
    }

    /// Message types with at least one handler
    pub fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        types.sort();
        types
    }

    /// Invoke every handler registered for the header's message type, in
    /// registration order.
    ///
    /// The handler list is snapshotted first, so concurrent add/remove calls
    /// never block on or disturb a running dispatch. A handler error or panic
    /// is logged and counted; the remaining handlers still run.
    pub async fn route(&self, header: &MessageHeader, payload: &MessagePayload) -> RouteReport {
        let message_type = header.message_class();
        let handlers: Vec<HandlerRef> = self
            .subscriptions
            .get(message_type)
            .map(|handlers| handlers.clone())
            .unwrap_or_default();

        let mut report = RouteReport {
            message_type: message_type.to_string(),
            invoked: handlers.len(),
            failed: 0,
        };

        if handlers.is_empty() {
            ROUTE_TOTAL.with_label_values(&["unmatched"]).inc();
            return report;
        }
        ROUTE_TOTAL.with_label_values(&["matched"]).inc();

        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle(header, payload))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    HANDLER_FAILURES_TOTAL.with_label_values(&["error"]).inc();
                    warn!(
                        "Handler {} failed on {} {}: {:#}",
                        handler.name(),
                        message_type,
                        header.uuid,
                        e
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    HANDLER_FAILURES_TOTAL.with_label_values(&["panic"]).inc();
                    error!(
                        "Handler {} panicked on {} {}",
                        handler.name(),
                        message_type,
                        header.uuid
                    );
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(MessageHeader, MessagePayload)>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, header: &MessageHeader, payload: &MessagePayload) -> anyhow::Result<()> {
            self.calls.lock().push((header.clone(), payload.clone()));
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        async fn handle(&self, _: &MessageHeader, _: &MessagePayload) -> anyhow::Result<()> {
            panic!("handler bug")
        }
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[tokio::test]
    async fn test_add_route_remove() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder::default());
        let handler: HandlerRef = recorder.clone();

        assert!(dispatcher.add("Orders.Created", handler.clone()));

        let header = MessageHeader::new("Orders.Created");
        let payload = Bytes::from_static(b"{\"id\":1}");
        let report = dispatcher.route(&header, &payload).await;

        assert_eq!(report.invoked, 1);
        assert!(report.all_succeeded());
        {
            let calls = recorder.calls.lock();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].0, header);
            assert_eq!(calls[0].1, payload);
        }

        assert!(dispatcher.remove("Orders.Created", &handler));
        dispatcher.route(&header, &payload).await;
        assert_eq!(recorder.count(), 1);
        assert!(!dispatcher.is_subscribed("Orders.Created"));
    }

    #[tokio::test]
    async fn test_duplicate_add_is_noop() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder::default());
        let handler: HandlerRef = recorder.clone();

        assert!(dispatcher.add("A", handler.clone()));
        assert!(!dispatcher.add("A", handler.clone()));
        assert_eq!(dispatcher.handler_count("A"), 1);

        dispatcher.route(&MessageHeader::new("A"), &Bytes::new()).await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let dispatcher = Dispatcher::new();
        let handler: HandlerRef = Arc::new(Recorder::default());

        assert!(!dispatcher.remove("A", &handler));
        assert_eq!(dispatcher.remove_all("A"), 0);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let dispatcher = Dispatcher::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        dispatcher.add("A", first.clone());
        dispatcher.add("A", second.clone());
        dispatcher.add("B", first.clone());

        assert_eq!(dispatcher.remove_all("A"), 2);

        let report = dispatcher.route(&MessageHeader::new("A"), &Bytes::new()).await;
        assert!(report.is_unmatched());
        assert_eq!(first.count(), 0);
        assert_eq!(second.count(), 0);
        assert_eq!(dispatcher.message_types(), vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_route_without_handlers() {
        let dispatcher = Dispatcher::new();
        let report = dispatcher
            .route(&MessageHeader::new("Nobody.Listens"), &Bytes::new())
            .await;

        assert!(report.is_unmatched());
        assert!(report.all_succeeded());
        assert!(dispatcher.message_types().is_empty());
    }

    #[tokio::test]
    async fn test_registration_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            dispatcher.add(
                "A",
                handler_fn(format!("h{}", i), move |_, _| {
                    let order = order.clone();
                    async move {
                        order.lock().push(i);
                        Ok(())
                    }
                }),
            );
        }

        dispatcher.route(&MessageHeader::new("A"), &Bytes::new()).await;
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failing_handlers_are_isolated() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder::default());

        dispatcher.add(
            "A",
            handler_fn("fails", |_, _| async { Err(anyhow::anyhow!("boom")) }),
        );
        dispatcher.add("A", Arc::new(Panicking));
        dispatcher.add("A", recorder.clone());

        let report = dispatcher.route(&MessageHeader::new("A"), &Bytes::new()).await;

        assert_eq!(report.invoked, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(recorder.count(), 1);
    }
}
