// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Prometheus Metrics for the Chat Relay

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Relay server metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Current open WebSocket connections, authenticated or not.
    pub connections_active: IntGauge,
    /// Rejected upgrades, capacity refusals and transport failures.
    pub connection_errors: IntCounter,
    /// Users with a registered live connection.
    pub users_online: IntGauge,

    // Frame metrics
    /// Total inbound frames.
    pub frames_received: IntCounter,
    /// Inbound frames answered with an `error` event.
    pub frames_rejected: IntCounter,
    /// Inbound frame processing duration in seconds.
    pub frame_duration: Histogram,

    // Routing metrics
    /// Chat messages written to the store.
    pub messages_persisted: IntCounter,
    /// Events queued on a receiver's connection.
    pub events_delivered: IntCounter,
    /// Events discarded because the receiver's queue was full.
    pub events_dropped: IntCounter,
    /// Store calls that failed.
    pub store_errors: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts");
    registry
        .register(Box::new(metric.clone()))
        .expect("counter registered once");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::with_opts(Opts::new(name, help)).expect("valid gauge opts");
    registry
        .register(Box::new(metric.clone()))
        .expect("gauge registered once");
    metric
}

impl RelayMetrics {
    /// Creates a new metrics instance with all collectors registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let frame_duration = Histogram::with_opts(HistogramOpts::new(
            "relay_frame_duration_seconds",
            "Inbound frame processing duration in seconds",
        ))
        .expect("valid histogram opts");
        registry
            .register(Box::new(frame_duration.clone()))
            .expect("histogram registered once");

        RelayMetrics {
            connections_total: counter(
                &registry,
                "relay_connections_total",
                "Total WebSocket connections accepted",
            ),
            connections_active: gauge(
                &registry,
                "relay_connections_active",
                "Current open WebSocket connections",
            ),
            connection_errors: counter(
                &registry,
                "relay_connection_errors_total",
                "Total connection errors",
            ),
            users_online: gauge(
                &registry,
                "relay_users_online",
                "Users with a live authenticated connection",
            ),
            frames_received: counter(
                &registry,
                "relay_frames_received_total",
                "Total inbound frames",
            ),
            frames_rejected: counter(
                &registry,
                "relay_frames_rejected_total",
                "Inbound frames answered with an error event",
            ),
            frame_duration,
            messages_persisted: counter(
                &registry,
                "relay_messages_persisted_total",
                "Chat messages written to the store",
            ),
            events_delivered: counter(
                &registry,
                "relay_events_delivered_total",
                "Events queued for a connected receiver",
            ),
            events_dropped: counter(
                &registry,
                "relay_events_dropped_total",
                "Events dropped because the receiver queue was full",
            ),
            store_errors: counter(
                &registry,
                "relay_store_errors_total",
                "Failed store calls",
            ),
            registry: Arc::new(registry),
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
