// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device registry.
//!
//! The registry is owned by the control center; the ingest server only reads
//! sensor parameters and running measurements, registers unknown devices and
//! sensors, and records connection state.

pub mod memory;
pub mod sqlite;

pub use crate::protocol::node::SensorParams;
pub use memory::{DeviceSeed, MeasurementSeed, MemoryRegistry, SensorSeed};
pub use sqlite::SqliteRegistry;

use crate::protocol::DeviceFamily;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Registry key of a device.
pub type DeviceId = i64;

/// A measurement run currently recording a device.
///
/// `name` selects the store bucket, `id` the measurement within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeasurementRun {
    pub name: String,
    pub id: u32,
}

impl MeasurementRun {
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

/// Registry error types.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {device} is registered with {registered} sensors but announced {announced}")]
    SensorCountMismatch {
        device: String,
        registered: usize,
        announced: usize,
    },

    #[error("sensor count required to register {family} device {device}")]
    MissingSensorCount { device: String, family: DeviceFamily },

    #[error("unknown device id {0}")]
    UnknownDevice(DeviceId),

    #[error("invalid registry record: {0}")]
    InvalidRecord(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Query interface of the control center, shared by all sessions.
pub trait Registry: Send + Sync {
    /// Id of device `name`, creating it when unknown.
    ///
    /// Families whose sensors the registry manages need `sensor_count` to
    /// create the device and fail when it disagrees with the stored count.
    fn resolve_or_register_device(
        &self,
        name: &str,
        family: DeviceFamily,
        sensor_count: Option<u8>,
    ) -> Result<DeviceId, RegistryError>;

    /// Parameters in sensor-id order; empty until the device is configured.
    fn sensor_params(&self, device: DeviceId) -> Result<Vec<SensorParams>, RegistryError>;

    /// Measurement runs currently recording `device`.
    fn running_measurements(&self, device: DeviceId) -> Result<Vec<MeasurementRun>, RegistryError>;

    /// Names of the device's named sensors.
    fn sensor_names(&self, device: DeviceId) -> Result<Vec<String>, RegistryError>;

    /// Append a sensor discovered in the data stream.
    fn register_sensor(&self, device: DeviceId, name: &str) -> Result<(), RegistryError>;

    fn set_connection_state(&self, device: DeviceId, connected: bool) -> Result<(), RegistryError>;

    /// Mark every device disconnected.
    fn reset_connection_states(&self) -> Result<(), RegistryError>;
}
