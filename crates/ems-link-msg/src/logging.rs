//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC message model and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use tracing::trace;

use crate::types::Message;

/// Direction of the frame movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Frame written to the socket.
    Outbound,
    /// Frame read from the socket.
    Inbound,
    /// Request re-issued after a reconnect.
    Replay,
}

/// Emit a structured log entry for one frame.
///
/// Params and results are never logged: they may carry credentials.
pub fn log_message(direction: MessageDirection, message: &Message) {
    trace!(
        kind = message.kind(),
        id = message.id().unwrap_or("-"),
        method = message.method().unwrap_or("-"),
        direction = ?direction,
        "json-rpc frame"
    );
}

/// Prometheus metric handles for client side RPC activity.
#[derive(Clone)]
pub struct RpcMetricsExporter {
    requests_sent: IntCounter,
    responses_received: IntCounter,
    notifications_received: IntCounter,
    request_timeouts: IntCounter,
    frames_dropped: IntCounter,
    reconnects: IntCounter,
    latency: Histogram,
}

impl RpcMetricsExporter {
    /// Register RPC metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let exporter = Self::unregistered()?;
        registry.register(Box::new(exporter.requests_sent.clone()))?;
        registry.register(Box::new(exporter.responses_received.clone()))?;
        registry.register(Box::new(exporter.notifications_received.clone()))?;
        registry.register(Box::new(exporter.request_timeouts.clone()))?;
        registry.register(Box::new(exporter.frames_dropped.clone()))?;
        registry.register(Box::new(exporter.reconnects.clone()))?;
        registry.register(Box::new(exporter.latency.clone()))?;
        Ok(exporter)
    }

    /// Build metric handles that are not exported anywhere.
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Ok(Self {
            requests_sent: IntCounter::with_opts(Opts::new(
                "ems_link_requests_sent_total",
                "JSON-RPC requests written to the connection",
            ))?,
            responses_received: IntCounter::with_opts(Opts::new(
                "ems_link_responses_received_total",
                "Responses matched to a pending request",
            ))?,
            notifications_received: IntCounter::with_opts(Opts::new(
                "ems_link_notifications_received_total",
                "Notifications handed to the router",
            ))?,
            request_timeouts: IntCounter::with_opts(Opts::new(
                "ems_link_request_timeouts_total",
                "Requests that expired without a response",
            ))?,
            frames_dropped: IntCounter::with_opts(Opts::new(
                "ems_link_frames_dropped_total",
                "Inbound frames that were malformed or unmatched",
            ))?,
            reconnects: IntCounter::with_opts(Opts::new(
                "ems_link_reconnects_total",
                "Connections re-established after a loss",
            ))?,
            latency: Histogram::with_opts(HistogramOpts::new(
                "ems_link_request_latency_seconds",
                "Time between writing a request and receiving its response",
            ))?,
        })
    }

    /// Record a sent request.
    pub fn observe_request(&self) {
        self.requests_sent.inc();
    }

    /// Record a matched response and its round trip time.
    pub fn observe_response(&self, latency: Duration) {
        self.responses_received.inc();
        self.latency.observe(latency.as_secs_f64());
    }

    /// Record a routed notification.
    pub fn observe_notification(&self) {
        self.notifications_received.inc();
    }

    /// Record an expired request.
    pub fn observe_timeout(&self) {
        self.request_timeouts.inc();
    }

    /// Record a dropped inbound frame.
    pub fn observe_dropped(&self) {
        self.frames_dropped.inc();
    }

    /// Record a successful reconnect.
    pub fn observe_reconnect(&self) {
        self.reconnects.inc();
    }
}

impl std::fmt::Debug for RpcMetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcMetricsExporter")
            .field("requests_sent", &self.requests_sent.get())
            .field("request_timeouts", &self.request_timeouts.get())
            .finish_non_exhaustive()
    }
}
