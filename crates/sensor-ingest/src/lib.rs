// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sensor telemetry ingest server
//!
//! Accepts raw TCP connections from field devices, decodes their binary
//! sample streams and writes the samples to a time-series store for every
//! measurement run recording the device.
//!
//! # Features
//!
//! - **Two device families**: multi-sensor nodes with negotiated sampling
//!   parameters, and FBGuard devices with a fixed 80-byte header
//! - **Stream framing**: partial and coalesced reads are reassembled
//! - **Live reconfiguration**: sensor node sessions restart when their
//!   parameters change in the registry
//! - **One session per device**: a reconnecting device replaces its stale session
//!
//! # Quick Start
//!
//! ```bash
//! # Static registry, line protocol on stdout
//! sensor-ingest --config ingest.toml
//!
//! # InfluxDB sink from the environment
//! INFLUXDB_ADMIN_TOKEN=... sensor-ingest --influx-url http://localhost:8086
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! [server]
//! port = 5123
//!
//! [registry]
//! backend = "sqlite"
//! path = "control_center.db"
//!
//! [sink]
//! backend = "influx"
//! url = "http://influxdb:8086"
//! org = "main"
//! token = "..."
//! ```

pub mod config;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod sink;

pub use config::{ConfigError, IngestConfig, RegistryConfig, SinkConfig};
pub use metrics::{IngestMetrics, MetricsSnapshot};
pub use protocol::{DeviceFamily, ProtocolError};
pub use registry::{MeasurementRun, MemoryRegistry, Registry, RegistryError, SensorParams, SqliteRegistry};
pub use server::session::{SessionEnd, SessionError};
pub use server::{IngestServer, RunningServer, ServerError, StopHandle};
pub use sink::{InfluxSink, MemorySink, Point, Precision, Sink, SinkError, WriterSink};
