// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-series sink.
//!
//! Sessions turn decoded samples into [`Point`]s and hand them to a [`Sink`]
//! one batch per measurement run. Backends:
//!
//! - [`InfluxSink`]: InfluxDB v2 HTTP write API
//! - [`WriterSink`]: line protocol to any `Write` (stdout by default)
//! - [`MemorySink`]: in-memory batches for tests

pub mod influx;
pub mod line_protocol;
pub mod memory;

pub use influx::InfluxSink;
pub use line_protocol::{LineProtocolWriter, WriterSink};
pub use memory::{MemorySink, WrittenBatch};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unit of a point's timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "ms")]
    Milliseconds,
    #[serde(rename = "us")]
    Microseconds,
    #[serde(rename = "ns")]
    Nanoseconds,
}

impl Precision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Milliseconds => "ms",
            Self::Microseconds => "us",
            Self::Nanoseconds => "ns",
        }
    }

    /// Convert a timestamp in this unit to nanoseconds (saturating).
    pub fn to_nanos(self, timestamp: u64) -> u64 {
        match self {
            Self::Milliseconds => timestamp.saturating_mul(1_000_000),
            Self::Microseconds => timestamp.saturating_mul(1_000),
            Self::Nanoseconds => timestamp,
        }
    }
}

/// One sample ready for the store.
///
/// Rendered as `<run_id>,sensor_node=<device> <sensor>=<value> <timestamp>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub run_id: u32,
    pub device: String,
    pub sensor: String,
    pub timestamp: u64,
    pub precision: Precision,
    pub value: f64,
}

impl Point {
    pub fn timestamp_ns(&self) -> u64 {
        self.precision.to_nanos(self.timestamp)
    }
}

/// Sink error types.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("store rejected batch for {bucket}: status {status}: {body}")]
    Rejected {
        bucket: String,
        status: u16,
        body: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write side of the time-series store.
///
/// Implementations are shared by every session thread.
pub trait Sink: Send + Sync {
    /// Build a point for one sample of a running measurement.
    fn make_point(
        &self,
        run_id: u32,
        device: &str,
        sensor: &str,
        timestamp: u64,
        value: f64,
        precision: Precision,
    ) -> Point {
        Point {
            run_id,
            device: device.to_string(),
            sensor: sensor.to_string(),
            timestamp,
            precision,
            value,
        }
    }

    /// Write `points` into the store of measurement run `run_name`.
    fn write_batch(&self, run_name: &str, points: Vec<Point>) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_to_nanos() {
        assert_eq!(Precision::Milliseconds.to_nanos(1_500), 1_500_000_000);
        assert_eq!(Precision::Microseconds.to_nanos(1_500), 1_500_000);
        assert_eq!(Precision::Nanoseconds.to_nanos(1_500), 1_500);
        assert_eq!(Precision::Milliseconds.to_nanos(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_default_make_point() {
        let sink = MemorySink::new();
        let point = sink.make_point(3, "node1", "temp", 1_000, 21.5, Precision::Milliseconds);
        assert_eq!(point.run_id, 3);
        assert_eq!(point.device, "node1");
        assert_eq!(point.sensor, "temp");
        assert_eq!(point.timestamp_ns(), 1_000_000_000);
    }
}
