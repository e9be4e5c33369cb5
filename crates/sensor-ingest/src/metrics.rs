// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingestion metrics.
//!
//! One [`IngestMetrics`] is shared by the listener and every session:
//! - Connection statistics (accepted, rejected, active sessions)
//! - Session churn (preemptions, parameter restarts)
//! - Byte and message throughput
//! - Sample delivery (written, dropped)
//! - Error counts
//!
//! # Example
//!
//! ```
//! use sensor_ingest::metrics::IngestMetrics;
//!
//! let metrics = IngestMetrics::new();
//! metrics.record_connection_accepted();
//! metrics.record_bytes_received(1024);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.connections_accepted, 1);
//! assert_eq!(snapshot.bytes_received, 1024);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Process-wide counters for the ingestion server.
#[derive(Debug)]
pub struct IngestMetrics {
    // Connection metrics
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    active_sessions: AtomicUsize,

    // Session churn
    preemptions: AtomicU64,
    param_restarts: AtomicU64,

    // Throughput
    bytes_received: AtomicU64,
    messages_decoded: AtomicU64,
    samples_received: AtomicU64,

    // Delivery
    points_written: AtomicU64,
    samples_dropped: AtomicU64,

    // Errors
    protocol_errors: AtomicU64,
    sink_errors: AtomicU64,

    start_time: Instant,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            active_sessions: AtomicUsize::new(0),
            preemptions: AtomicU64::new(0),
            param_restarts: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_decoded: AtomicU64::new(0),
            samples_received: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            sink_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Connection closed without identifying as a known device.
    pub fn record_connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_ended(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_param_restart(&self) {
        self.param_restarts.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Throughput
    // ========================================================================

    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_messages_decoded(&self, messages: usize, samples: usize) {
        self.messages_decoded
            .fetch_add(messages as u64, Ordering::Relaxed);
        self.samples_received
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_points_written(&self, points: usize) {
        self.points_written
            .fetch_add(points as u64, Ordering::Relaxed);
    }

    /// Samples decoded while no measurement run was active.
    pub fn record_samples_dropped(&self, samples: usize) {
        self.samples_dropped
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    // ========================================================================
    // Errors
    // ========================================================================

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_error(&self) {
        self.sink_errors.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            param_restarts: self.param_restarts.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_decoded: self.messages_decoded.load(Ordering::Relaxed),
            samples_received: self.samples_received.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`IngestMetrics`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub active_sessions: usize,
    pub preemptions: u64,
    pub param_restarts: u64,
    pub bytes_received: u64,
    pub messages_decoded: u64,
    pub samples_received: u64,
    pub points_written: u64,
    pub samples_dropped: u64,
    pub protocol_errors: u64,
    pub sink_errors: u64,
    pub uptime_secs: f64,
}

impl MetricsSnapshot {
    /// Points written per second since startup.
    pub fn write_rate(&self) -> f64 {
        if self.uptime_secs > 0.0 {
            self.points_written as f64 / self.uptime_secs
        } else {
            0.0
        }
    }

    /// Points written per second between `earlier` and `self`.
    pub fn write_rate_since(&self, earlier: &MetricsSnapshot) -> f64 {
        let elapsed = self.uptime_secs - earlier.uptime_secs;
        if elapsed > 0.0 {
            self.points_written.saturating_sub(earlier.points_written) as f64 / elapsed
        } else {
            0.0
        }
    }
}
