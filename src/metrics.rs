//! Prometheus Metrics for the Chat Relay
//!
//! Provides observability metrics for monitoring the relay server.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Relay server metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total WebSocket sessions established.
    pub connections_total: IntCounter,
    /// Current active sessions.
    pub connections_active: IntGauge,
    /// Rejected upgrades, failed handshakes, capacity refusals.
    pub connection_errors: IntCounter,
    /// Sessions closed because the same user connected again.
    pub sessions_superseded: IntCounter,

    // Message metrics
    /// Messages accepted from clients.
    pub messages_received: IntCounter,
    /// Messages handed to a live session.
    pub messages_delivered: IntCounter,
    /// Messages written to the offline queue.
    pub messages_queued: IntCounter,
    /// Messages that reached neither a session nor the queue.
    pub messages_lost: IntCounter,
    /// Frames discarded (malformed or oversized).
    pub messages_rejected: IntCounter,
    /// Time spent routing one message.
    pub route_duration: Histogram,

    // Storage metrics
    /// Message log appends that failed.
    pub log_failures: IntCounter,
    /// Offline queue operations that failed.
    pub queue_failures: IntCounter,
    /// Offline messages pushed to reconnecting users.
    pub offline_drained: IntCounter,
    /// Offline messages discarded by retention cleanup.
    pub offline_expired: IntCounter,
    /// Current number of queued offline messages.
    pub offline_pending: IntGauge,
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("valid counter definition")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(name, help)).expect("valid gauge definition")
}

impl RelayMetrics {
    /// Creates a new metrics instance with all collectors registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let metrics = RelayMetrics {
            connections_total: counter(
                "chat_relay_connections_total",
                "Total WebSocket sessions established",
            ),
            connections_active: gauge(
                "chat_relay_connections_active",
                "Current active WebSocket sessions",
            ),
            connection_errors: counter(
                "chat_relay_connection_errors_total",
                "Total connection errors",
            ),
            sessions_superseded: counter(
                "chat_relay_sessions_superseded_total",
                "Sessions replaced by a newer connection for the same user",
            ),
            messages_received: counter(
                "chat_relay_messages_received_total",
                "Total messages received",
            ),
            messages_delivered: counter(
                "chat_relay_messages_delivered_total",
                "Messages delivered to a live session",
            ),
            messages_queued: counter(
                "chat_relay_messages_queued_total",
                "Messages stored for offline recipients",
            ),
            messages_lost: counter(
                "chat_relay_messages_lost_total",
                "Messages neither delivered nor queued",
            ),
            messages_rejected: counter(
                "chat_relay_messages_rejected_total",
                "Inbound frames discarded",
            ),
            route_duration: Histogram::with_opts(HistogramOpts::new(
                "chat_relay_route_duration_seconds",
                "Message routing duration in seconds",
            ))
            .expect("valid histogram definition"),
            log_failures: counter(
                "chat_relay_log_failures_total",
                "Failed message log appends",
            ),
            queue_failures: counter(
                "chat_relay_queue_failures_total",
                "Failed offline queue operations",
            ),
            offline_drained: counter(
                "chat_relay_offline_drained_total",
                "Offline messages delivered on reconnect",
            ),
            offline_expired: counter(
                "chat_relay_offline_expired_total",
                "Offline messages dropped by retention cleanup",
            ),
            offline_pending: gauge(
                "chat_relay_offline_pending",
                "Current number of queued offline messages",
            ),
            registry: Arc::new(registry),
        };

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(metrics.connections_total.clone()),
            Box::new(metrics.connections_active.clone()),
            Box::new(metrics.connection_errors.clone()),
            Box::new(metrics.sessions_superseded.clone()),
            Box::new(metrics.messages_received.clone()),
            Box::new(metrics.messages_delivered.clone()),
            Box::new(metrics.messages_queued.clone()),
            Box::new(metrics.messages_lost.clone()),
            Box::new(metrics.messages_rejected.clone()),
            Box::new(metrics.route_duration.clone()),
            Box::new(metrics.log_failures.clone()),
            Box::new(metrics.queue_failures.clone()),
            Box::new(metrics.offline_drained.clone()),
            Box::new(metrics.offline_expired.clone()),
            Box::new(metrics.offline_pending.clone()),
        ];
        for collector in collectors {
            metrics
                .registry
                .register(collector)
                .expect("metric names are unique");
        }

        metrics
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
