//! Observability and Metrics
//!
//! Atomic counters for handshakes, short-link requests, long-link connections
//! and push traffic. A process-wide instance is available through
//! [`global_metrics`]; components may also be handed their own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for transport operations
#[derive(Debug)]
pub struct Metrics {
    /// Total handshake attempts
    pub handshakes_total: AtomicU64,
    /// Successful handshakes
    pub handshakes_success: AtomicU64,
    /// Failed handshakes
    pub handshakes_failed: AtomicU64,
    /// Requests sent
    pub requests_sent: AtomicU64,
    /// Responses decoded successfully
    pub responses_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Frames rejected as corrupt
    pub frames_corrupt: AtomicU64,
    /// Session-timeout responses
    pub sessions_expired: AtomicU64,
    /// Other remote-status responses
    pub remote_status_errors: AtomicU64,
    /// Long-link connections opened
    pub links_total: AtomicU64,
    /// Long-link connections currently open
    pub links_active: AtomicU64,
    /// Push events dispatched to handlers
    pub push_events: AtomicU64,
    /// Heartbeats sent
    pub heartbeats_sent: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_corrupt: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
            remote_status_errors: AtomicU64::new(0),
            links_total: AtomicU64::new(0),
            links_active: AtomicU64::new(0),
            push_events: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a handshake attempt
    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful handshake
    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed handshake
    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request sent
    pub fn request_sent(&self, byte_count: u64) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a response received
    pub fn response_received(&self, byte_count: u64) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a corrupt frame
    pub fn frame_corrupt(&self) {
        self.frames_corrupt.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session-timeout response
    pub fn session_expired(&self) {
        self.sessions_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a remote-status response
    pub fn remote_status(&self) {
        self.remote_status_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a long-link connection opened
    pub fn link_opened(&self) {
        self.links_total.fetch_add(1, Ordering::Relaxed);
        self.links_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a long-link connection closed
    pub fn link_closed(&self) {
        self.links_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a push event handed to the event loop
    pub fn push_event(&self) {
        self.push_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a heartbeat
    pub fn heartbeat(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_corrupt: self.frames_corrupt.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            remote_status_errors: self.remote_status_errors.load(Ordering::Relaxed),
            links_total: self.links_total.load(Ordering::Relaxed),
            links_active: self.links_active.load(Ordering::Relaxed),
            push_events: self.push_events.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            requests_sent = snapshot.requests_sent,
            responses_received = snapshot.responses_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            frames_corrupt = snapshot.frames_corrupt,
            sessions_expired = snapshot.sessions_expired,
            remote_status_errors = snapshot.remote_status_errors,
            links_total = snapshot.links_total,
            links_active = snapshot.links_active,
            push_events = snapshot.push_events,
            heartbeats_sent = snapshot.heartbeats_sent,
            uptime_seconds = snapshot.uptime_seconds,
            "Transport metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_corrupt: u64,
    pub sessions_expired: u64,
    pub remote_status_errors: u64,
    pub links_total: u64,
    pub links_active: u64,
    pub push_events: u64,
    pub heartbeats_sent: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.request_sent(100);
        metrics.request_sent(50);
        metrics.link_opened();
        metrics.link_closed();
        let snap = metrics.snapshot();
        assert_eq!(snap.requests_sent, 2);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.links_total, 1);
        assert_eq!(snap.links_active, 0);
    }

    #[test]
    fn logging_a_snapshot_leaves_counters_untouched() {
        let metrics = Metrics::new();
        metrics.heartbeat();
        metrics.log_metrics();
        assert_eq!(metrics.snapshot().heartbeats_sent, 1);
    }
}
