//! Network Statistics
//!
//! Atomic counters for traffic, session lifecycle and queue drops.
//!
//! A dropped packet is silent to the peer. These counters are where drops
//! under pressure become visible, split by whether the queue policy or the
//! queue capacity refused the packet.

use crate::session::disconnect::DisconnectCause;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

const CAUSE_COUNT: usize = DisconnectCause::ALL.len();

fn cause_index(cause: DisconnectCause) -> usize {
    DisconnectCause::ALL
        .iter()
        .position(|c| *c == cause)
        .unwrap_or(CAUSE_COUNT - 1)
}

#[derive(Debug)]
pub struct NetworkStatistics {
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    /// Refused by the connection filter before a session existed
    pub connections_refused: AtomicU64,
    pub packets_read: AtomicU64,
    pub bytes_read: AtomicU64,
    pub packets_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub dropped_by_policy: AtomicU64,
    pub dropped_by_full: AtomicU64,
    /// Framing, transform and deserialization failures
    pub decode_errors: AtomicU64,
    pub write_errors: AtomicU64,
    /// Events lost because the request queue was full or closed
    pub requests_dropped: AtomicU64,
    closed_by_cause: [AtomicU64; CAUSE_COUNT],
    start_time: Instant,
}

impl NetworkStatistics {
    pub fn new() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            connections_refused: AtomicU64::new(0),
            packets_read: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            packets_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            dropped_by_policy: AtomicU64::new(0),
            dropped_by_full: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            requests_dropped: AtomicU64::new(0),
            closed_by_cause: std::array::from_fn(|_| AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self, cause: DisconnectCause) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        self.closed_by_cause[cause_index(cause)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one decoded inbound message
    pub fn packet_read(&self) {
        self.packets_read.fetch_add(1, Ordering::Relaxed);
    }

    /// Record raw inbound bytes
    pub fn bytes_received(&self, byte_count: u64) {
        self.bytes_read.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_written(&self, byte_count: u64) {
        self.packets_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_dropped_by_policy(&self) {
        self.dropped_by_policy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_dropped_by_full(&self) {
        self.dropped_by_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn closed_with(&self, cause: DisconnectCause) -> u64 {
        self.closed_by_cause[cause_index(cause)].load(Ordering::Relaxed)
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let opened = self.sessions_opened.load(Ordering::Relaxed);
        let closed = self.sessions_closed.load(Ordering::Relaxed);
        StatisticsSnapshot {
            sessions_opened: opened,
            sessions_closed: closed,
            sessions_active: opened.saturating_sub(closed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            packets_read: self.packets_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            dropped_by_policy: self.dropped_by_policy.load(Ordering::Relaxed),
            dropped_by_full: self.dropped_by_full.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            requests_dropped: self.requests_dropped.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current statistics
    pub fn log_statistics(&self) {
        let snapshot = self.snapshot();
        info!(
            sessions_opened = snapshot.sessions_opened,
            sessions_closed = snapshot.sessions_closed,
            sessions_active = snapshot.sessions_active,
            connections_refused = snapshot.connections_refused,
            packets_read = snapshot.packets_read,
            bytes_read = snapshot.bytes_read,
            packets_written = snapshot.packets_written,
            bytes_written = snapshot.bytes_written,
            dropped_by_policy = snapshot.dropped_by_policy,
            dropped_by_full = snapshot.dropped_by_full,
            decode_errors = snapshot.decode_errors,
            write_errors = snapshot.write_errors,
            requests_dropped = snapshot.requests_dropped,
            uptime_seconds = snapshot.uptime_seconds,
            "Network statistics snapshot"
        );
    }
}

impl Default for NetworkStatistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of statistics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_active: u64,
    pub connections_refused: u64,
    pub packets_read: u64,
    pub bytes_read: u64,
    pub packets_written: u64,
    pub bytes_written: u64,
    pub dropped_by_policy: u64,
    pub dropped_by_full: u64,
    pub decode_errors: u64,
    pub write_errors: u64,
    pub requests_dropped: u64,
    pub uptime_seconds: u64,
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
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}
