// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory registry.
//!
//! Seeded from the `[registry]` section of the config file for standalone
//! deployments, and mutated directly by tests to play the control center.

use super::{DeviceId, MeasurementRun, Registry, RegistryError, SensorParams};
use crate::protocol::DeviceFamily;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Static device description from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSeed {
    pub name: String,
    pub family: DeviceFamily,
    #[serde(default)]
    pub sensors: Vec<SensorSeed>,
    #[serde(default)]
    pub measurements: Vec<MeasurementSeed>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSeed {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_period_ms: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples_per_message: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSeed {
    pub name: String,
    pub id: u32,
}

#[derive(Debug, Clone, Default)]
struct SensorRecord {
    name: Option<String>,
    sample_period_ms: Option<i32>,
    samples_per_message: Option<u8>,
}

#[derive(Debug, Clone)]
struct DeviceRecord {
    id: DeviceId,
    name: String,
    family: DeviceFamily,
    initialized: bool,
    connected: bool,
    sensors: Vec<SensorRecord>,
    runs: Vec<MeasurementRun>,
}

#[derive(Default)]
struct Inner {
    devices: Vec<DeviceRecord>,
    next_id: DeviceId,
}

impl Inner {
    fn device(&self, id: DeviceId) -> Result<&DeviceRecord, RegistryError> {
        self.devices
            .iter()
            .find(|d| d.id == id)
            .ok_or(RegistryError::UnknownDevice(id))
    }

    fn device_mut(&mut self, id: DeviceId) -> Result<&mut DeviceRecord, RegistryError> {
        self.devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(RegistryError::UnknownDevice(id))
    }

    fn insert(&mut self, name: &str, family: DeviceFamily, sensors: Vec<SensorRecord>) -> DeviceId {
        self.next_id += 1;
        let id = self.next_id;
        self.devices.push(DeviceRecord {
            id,
            name: name.to_string(),
            family,
            initialized: false,
            connected: false,
            sensors,
            runs: Vec::new(),
        });
        id
    }
}

/// Registry held entirely in memory.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry holding `seeds`, each marked initialized.
    pub fn from_seeds(seeds: &[DeviceSeed]) -> Self {
        let registry = Self::new();
        {
            let mut inner = registry.inner.lock();
            for seed in seeds {
                let sensors = seed
                    .sensors
                    .iter()
                    .map(|s| SensorRecord {
                        name: Some(s.name.clone()),
                        sample_period_ms: s.sample_period_ms,
                        samples_per_message: s.samples_per_message,
                    })
                    .collect();
                let id = inner.insert(&seed.name, seed.family, sensors);
                if let Ok(device) = inner.device_mut(id) {
                    device.initialized = true;
                    device.runs = seed
                        .measurements
                        .iter()
                        .map(|m| MeasurementRun::new(m.name.clone(), m.id))
                        .collect();
                }
            }
        }
        registry
    }

    /// Add an initialized device with fully configured sensors.
    pub fn seed_device(&self, name: &str, family: DeviceFamily, params: &[SensorParams]) -> DeviceId {
        let mut inner = self.inner.lock();
        let id = inner.insert(name, family, params.iter().map(configured).collect());
        if let Ok(device) = inner.device_mut(id) {
            device.initialized = true;
        }
        id
    }

    /// Replace a device's sensor configuration and mark it initialized.
    pub fn set_sensor_params(&self, device: DeviceId, params: &[SensorParams]) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let record = inner.device_mut(device)?;
        record.sensors = params.iter().map(configured).collect();
        record.initialized = true;
        Ok(())
    }

    pub fn start_measurement(&self, device: DeviceId, run: MeasurementRun) -> Result<(), RegistryError> {
        self.inner.lock().device_mut(device)?.runs.push(run);
        Ok(())
    }

    pub fn stop_measurements(&self, device: DeviceId) -> Result<(), RegistryError> {
        self.inner.lock().device_mut(device)?.runs.clear();
        Ok(())
    }

    pub fn device_id(&self, name: &str) -> Option<DeviceId> {
        self.inner
            .lock()
            .devices
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.id)
    }

    pub fn device_family(&self, device: DeviceId) -> Option<DeviceFamily> {
        self.inner.lock().device(device).ok().map(|d| d.family)
    }

    pub fn is_connected(&self, device: DeviceId) -> Option<bool> {
        self.inner.lock().device(device).ok().map(|d| d.connected)
    }

    pub fn sensor_count(&self, device: DeviceId) -> Option<usize> {
        self.inner.lock().device(device).ok().map(|d| d.sensors.len())
    }

    pub fn device_count(&self) -> usize {
        self.inner.lock().devices.len()
    }
}

fn configured(params: &SensorParams) -> SensorRecord {
    SensorRecord {
        name: Some(params.name.clone()),
        sample_period_ms: Some(params.sample_period_ms),
        samples_per_message: Some(params.samples_per_message),
    }
}

impl Registry for MemoryRegistry {
    fn resolve_or_register_device(
        &self,
        name: &str,
        family: DeviceFamily,
        sensor_count: Option<u8>,
    ) -> Result<DeviceId, RegistryError> {
        let mut inner = self.inner.lock();

        if let Some(device) = inner.devices.iter().find(|d| d.name == name) {
            if device.family.manages_sensors() {
                let announced = sensor_count.map(usize::from).unwrap_or(0);
                if announced != device.sensors.len() {
                    return Err(RegistryError::SensorCountMismatch {
                        device: name.to_string(),
                        registered: device.sensors.len(),
                        announced,
                    });
                }
            }
            return Ok(device.id);
        }

        let sensors = if family.manages_sensors() {
            let count = sensor_count.ok_or_else(|| RegistryError::MissingSensorCount {
                device: name.to_string(),
                family,
            })?;
            vec![SensorRecord::default(); count as usize]
        } else {
            Vec::new()
        };
        let id = inner.insert(name, family, sensors);
        info!(device = %name, %family, id, "Device registered");
        Ok(id)
    }

    fn sensor_params(&self, device: DeviceId) -> Result<Vec<SensorParams>, RegistryError> {
        let inner = self.inner.lock();
        let record = inner.device(device)?;
        if !record.initialized {
            return Ok(Vec::new());
        }

        let params = record
            .sensors
            .iter()
            .enumerate()
            .map(|(index, s)| {
                Some(SensorParams {
                    sample_period_ms: s.sample_period_ms?,
                    samples_per_message: s.samples_per_message?,
                    name: s.name.clone().unwrap_or_else(|| index.to_string()),
                })
            })
            .collect::<Option<Vec<_>>>();
        Ok(params.unwrap_or_default())
    }

    fn running_measurements(&self, device: DeviceId) -> Result<Vec<MeasurementRun>, RegistryError> {
        Ok(self.inner.lock().device(device)?.runs.clone())
    }

    fn sensor_names(&self, device: DeviceId) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .inner
            .lock()
            .device(device)?
            .sensors
            .iter()
            .filter_map(|s| s.name.clone())
            .filter(|n| !n.is_empty())
            .collect())
    }

    fn register_sensor(&self, device: DeviceId, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let record = inner.device_mut(device)?;
        record.sensors.push(SensorRecord {
            name: Some(name.to_string()),
            ..Default::default()
        });
        info!(device = %record.name, sensor = %name, "Sensor registered");
        Ok(())
    }

    fn set_connection_state(&self, device: DeviceId, connected: bool) -> Result<(), RegistryError> {
        self.inner.lock().device_mut(device)?.connected = connected;
        Ok(())
    }

    fn reset_connection_states(&self) -> Result<(), RegistryError> {
        for device in self.inner.lock().devices.iter_mut() {
            device.connected = false;
        }
        Ok(())
    }
}
