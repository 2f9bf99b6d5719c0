//! Lifecycle Metrics
//!
//! Prometheus counters for connection lifecycle events. The registry is owned
//! here and rendered in the text exposition format on demand.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::connection::FailureClass;
use crate::Result;

/// Collects lifecycle metrics for all services sharing a context
pub struct Metrics {
    registry: Registry,
    connections_accepted: IntCounter,
    connections_closed: IntCounter,
    active_sessions: IntGauge,
    dial_attempts: IntCounter,
    dial_failures: IntCounterVec,
    bind_retries: IntCounter,
    bytes_received: IntCounter,
    bytes_sent: IntCounter,
}

impl Metrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let connections_accepted = IntCounter::new(
            "tcplink_connections_accepted_total",
            "Inbound connections accepted by listeners",
        )?;
        let connections_closed = IntCounter::new(
            "tcplink_connections_closed_total",
            "Sessions that reported closure",
        )?;
        let active_sessions =
            IntGauge::new("tcplink_active_sessions", "Sessions currently open")?;
        let dial_attempts = IntCounter::new(
            "tcplink_dial_attempts_total",
            "Outbound connection attempts",
        )?;
        let dial_failures = IntCounterVec::new(
            Opts::new(
                "tcplink_dial_failures_total",
                "Failed outbound attempts by failure class",
            ),
            &["class"],
        )?;
        let bind_retries = IntCounter::new(
            "tcplink_bind_retries_total",
            "Listener bind attempts retried on address contention",
        )?;
        let bytes_received =
            IntCounter::new("tcplink_bytes_received_total", "Bytes read from peers")?;
        let bytes_sent = IntCounter::new("tcplink_bytes_sent_total", "Bytes written to peers")?;

        registry.register(Box::new(connections_accepted.clone()))?;
        registry.register(Box::new(connections_closed.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(dial_attempts.clone()))?;
        registry.register(Box::new(dial_failures.clone()))?;
        registry.register(Box::new(bind_retries.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;

        Ok(Self {
            registry,
            connections_accepted,
            connections_closed,
            active_sessions,
            dial_attempts,
            dial_failures,
            bind_retries,
            bytes_received,
            bytes_sent,
        })
    }

    pub fn record_accept(&self) {
        self.connections_accepted.inc();
    }

    /// A session (inbound or outbound) became live
    pub fn session_opened(&self) {
        self.active_sessions.inc();
    }

    /// A session reported closure
    pub fn session_closed(&self) {
        self.connections_closed.inc();
        self.active_sessions.dec();
    }

    pub fn record_dial_attempt(&self) {
        self.dial_attempts.inc();
    }

    pub fn record_dial_failure(&self, class: FailureClass) {
        self.dial_failures.with_label_values(&[class.as_str()]).inc();
    }

    pub fn record_bind_retry(&self) {
        self.bind_retries.inc();
    }

    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.inc_by(bytes as u64);
    }

    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.inc_by(bytes as u64);
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get()
    }

    pub fn dial_attempts(&self) -> u64 {
        self.dial_attempts.get()
    }

    pub fn bind_retries(&self) -> u64 {
        self.bind_retries.get()
    }

    pub fn dial_failures(&self, class: FailureClass) -> u64 {
        self.dial_failures.with_label_values(&[class.as_str()]).get()
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}
