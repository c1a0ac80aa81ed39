//! Pluggable metrics.
//!
//! Every method has a no-op default so sinks only implement the
//! counters they care about. [`AtomicMetrics`] is an in-process sink
//! with readable counters, handy in tests and for exposing a stats
//! endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Counter sink for runtime events.
pub trait MetricsSink: Send + Sync {
    fn connection_opened(&self) {}
    fn connection_closed(&self) {}
    fn session_created(&self) {}
    fn session_suspended(&self) {}
    fn session_reconnected(&self) {}
    fn session_closed(&self) {}
    fn message_received(&self, _event: &str) {}
    fn message_sent(&self, _event: &str) {}
    fn error(&self, _code: u16) {}
    fn room_joined(&self) {}
    fn room_left(&self) {}
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// In-process sink backed by atomic counters.
#[derive(Default)]
pub struct AtomicMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    sessions_created: AtomicU64,
    sessions_suspended: AtomicU64,
    sessions_reconnected: AtomicU64,
    sessions_closed: AtomicU64,
    rooms_joined: AtomicU64,
    rooms_left: AtomicU64,
    received_by_event: Mutex<HashMap<String, u64>>,
    sent_by_event: Mutex<HashMap<String, u64>>,
    errors_by_code: Mutex<HashMap<u16, u64>>,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    pub fn sessions_suspended(&self) -> u64 {
        self.sessions_suspended.load(Ordering::Relaxed)
    }

    pub fn sessions_reconnected(&self) -> u64 {
        self.sessions_reconnected.load(Ordering::Relaxed)
    }

    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }

    pub fn rooms_joined(&self) -> u64 {
        self.rooms_joined.load(Ordering::Relaxed)
    }

    pub fn rooms_left(&self) -> u64 {
        self.rooms_left.load(Ordering::Relaxed)
    }

    pub fn received(&self, event: &str) -> u64 {
        self.received_by_event.lock().get(event).copied().unwrap_or(0)
    }

    pub fn sent(&self, event: &str) -> u64 {
        self.sent_by_event.lock().get(event).copied().unwrap_or(0)
    }

    pub fn errors(&self, code: u16) -> u64 {
        self.errors_by_code.lock().get(&code).copied().unwrap_or(0)
    }
}

impl MetricsSink for AtomicMetrics {
    fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    fn session_suspended(&self) {
        self.sessions_suspended.fetch_add(1, Ordering::Relaxed);
    }

    fn session_reconnected(&self) {
        self.sessions_reconnected.fetch_add(1, Ordering::Relaxed);
    }

    fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn message_received(&self, event: &str) {
        *self
            .received_by_event
            .lock()
            .entry(event.to_string())
            .or_insert(0) += 1;
    }

    fn message_sent(&self, event: &str) {
        *self
            .sent_by_event
            .lock()
            .entry(event.to_string())
            .or_insert(0) += 1;
    }

    fn error(&self, code: u16) {
        *self.errors_by_code.lock().entry(code).or_insert(0) += 1;
    }

    fn room_joined(&self) {
        self.rooms_joined.fetch_add(1, Ordering::Relaxed);
    }

    fn room_left(&self) {
        self.rooms_left.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_counters_accumulate() {
        let metrics = AtomicMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        assert_eq!(metrics.connections_opened(), 2);
        assert_eq!(metrics.connections_closed(), 1);
    }

    #[test]
    fn per_event_counters() {
        let metrics = AtomicMetrics::new();
        metrics.message_received("util.echo");
        metrics.message_received("util.echo");
        metrics.message_sent("util.echo.response");
        assert_eq!(metrics.received("util.echo"), 2);
        assert_eq!(metrics.sent("util.echo.response"), 1);
        assert_eq!(metrics.received("other"), 0);
    }

    #[test]
    fn error_counters_by_code() {
        let metrics = AtomicMetrics::new();
        metrics.error(1009);
        metrics.error(1009);
        metrics.error(1500);
        assert_eq!(metrics.errors(1009), 2);
        assert_eq!(metrics.errors(1500), 1);
        assert_eq!(metrics.errors(1000), 0);
    }

    #[test]
    fn noop_sink_is_callable() {
        let metrics = NoopMetrics;
        metrics.connection_opened();
        metrics.message_received("x");
        metrics.error(1500);
    }
}
