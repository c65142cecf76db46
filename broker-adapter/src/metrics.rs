//! Prometheus metrics for the broker adapter

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, HistogramVec,
    IntCounter,
};

lazy_static! {
    /// Total messages published
    pub static ref PUBLISH_TOTAL: CounterVec = register_counter_vec!(
        "broker_adapter_publish_total",
        "Total messages published",
        &["status"]
    )
    .unwrap();

    /// Message publish duration
    pub static ref PUBLISH_DURATION: HistogramVec = register_histogram_vec!(
        "broker_adapter_publish_duration_seconds",
        "Message publish duration in seconds",
        &["status"]
    )
    .unwrap();

    /// Deliveries routed through the dispatcher
    pub static ref ROUTE_TOTAL: CounterVec = register_counter_vec!(
        "broker_adapter_route_total",
        "Deliveries routed to local handlers",
        &["status"]
    )
    .unwrap();

    /// Handler invocations that failed
    pub static ref HANDLER_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "broker_adapter_handler_failures_total",
        "Handler invocations that returned an error or panicked",
        &["kind"]
    )
    .unwrap();

    /// Queue bindings created by the provisioner
    pub static ref BINDINGS_PROVISIONED_TOTAL: IntCounter = register_int_counter!(
        "broker_adapter_bindings_provisioned_total",
        "Queue bindings created on demand"
    )
    .unwrap();

    /// Published messages looped back into local dispatch
    pub static ref LOOPBACK_TOTAL: IntCounter = register_int_counter!(
        "broker_adapter_loopback_total",
        "Published messages looped back locally"
    )
    .unwrap();
}
