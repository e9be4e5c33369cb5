// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite registry over the control-center schema.
//!
//! Thread-safe via internal Mutex (SQLite Connection is not Sync).
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE control_center_sensornode (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     name TEXT NOT NULL UNIQUE,
//!     initialized INTEGER NOT NULL DEFAULT 0,
//!     type INTEGER NOT NULL,
//!     connected INTEGER NOT NULL DEFAULT 0
//! );
//! CREATE TABLE control_center_sensor (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     sensor_node_id INTEGER NOT NULL,
//!     id_in_sensor_node INTEGER NOT NULL,
//!     name TEXT,
//!     sample_period INTEGER,
//!     samples_per_packet INTEGER
//! );
//! CREATE TABLE control_center_project (id, name);
//! CREATE TABLE control_center_measurement (id, project_id, id_in_project, start_time, end_time);
//! CREATE TABLE control_center_measurement_sensor_nodes (id, measurement_id, sensornode_id);
//! ```
//!
//! A measurement is running while its `end_time` is NULL.

use super::{DeviceId, MeasurementRun, Registry, RegistryError, SensorParams};
use crate::protocol::node::MAX_SAMPLES_PER_MESSAGE;
use crate::protocol::DeviceFamily;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS control_center_sensornode (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    initialized INTEGER NOT NULL DEFAULT 0,
    type INTEGER NOT NULL,
    connected INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS control_center_sensor (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sensor_node_id INTEGER NOT NULL
        REFERENCES control_center_sensornode(id) ON DELETE CASCADE,
    id_in_sensor_node INTEGER NOT NULL,
    name TEXT,
    sample_period INTEGER,
    samples_per_packet INTEGER,
    UNIQUE (sensor_node_id, id_in_sensor_node)
);
CREATE TABLE IF NOT EXISTS control_center_project (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS control_center_measurement (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL
        REFERENCES control_center_project(id) ON DELETE CASCADE,
    id_in_project INTEGER NOT NULL,
    start_time TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    end_time TEXT,
    UNIQUE (project_id, id_in_project)
);
CREATE TABLE IF NOT EXISTS control_center_measurement_sensor_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    measurement_id INTEGER NOT NULL
        REFERENCES control_center_measurement(id) ON DELETE CASCADE,
    sensornode_id INTEGER NOT NULL
        REFERENCES control_center_sensornode(id) ON DELETE CASCADE,
    UNIQUE (measurement_id, sensornode_id)
);
CREATE INDEX IF NOT EXISTS idx_sensor_node ON control_center_sensor(sensor_node_id);
";

pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (or create) the registry database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// In-memory registry (for testing).
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run administrative SQL against the registry database.
    pub fn execute_batch(&self, sql: &str) -> Result<(), RegistryError> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

impl Registry for SqliteRegistry {
    fn resolve_or_register_device(
        &self,
        name: &str,
        family: DeviceFamily,
        sensor_count: Option<u8>,
    ) -> Result<DeviceId, RegistryError> {
        let mut conn = self.conn.lock();

        let existing: Option<(DeviceId, u8)> = conn
            .query_row(
                "SELECT id, type FROM control_center_sensornode WHERE name = ?1",
                [name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((id, code)) = existing {
            let stored = DeviceFamily::from_u8(code).ok_or_else(|| {
                RegistryError::InvalidRecord(format!("device {} has unknown type {}", name, code))
            })?;
            if stored.manages_sensors() {
                let registered: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM control_center_sensor WHERE sensor_node_id = ?1",
                    [id],
                    |row| row.get(0),
                )?;
                let announced = sensor_count.map(usize::from).unwrap_or(0);
                if registered as usize != announced {
                    return Err(RegistryError::SensorCountMismatch {
                        device: name.to_string(),
                        registered: registered as usize,
                        announced,
                    });
                }
            }
            return Ok(id);
        }

        let count = match (family.manages_sensors(), sensor_count) {
            (true, Some(count)) => count,
            (true, None) => {
                return Err(RegistryError::MissingSensorCount {
                    device: name.to_string(),
                    family,
                })
            }
            (false, _) => 0,
        };

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO control_center_sensornode (name, type) VALUES (?1, ?2)",
            params![name, family.as_u8()],
        )?;
        let id = tx.last_insert_rowid();
        for index in 0..count {
            tx.execute(
                "INSERT INTO control_center_sensor (sensor_node_id, id_in_sensor_node)
                 VALUES (?1, ?2)",
                params![id, index],
            )?;
        }
        tx.commit()?;

        info!(device = %name, %family, id, "Device registered");
        Ok(id)
    }

    fn sensor_params(&self, device: DeviceId) -> Result<Vec<SensorParams>, RegistryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s.id_in_sensor_node, s.name, s.sample_period, s.samples_per_packet
             FROM control_center_sensor s
             JOIN control_center_sensornode n ON n.id = s.sensor_node_id
             WHERE n.id = ?1 AND n.initialized = 1
             ORDER BY s.id_in_sensor_node ASC",
        )?;

        let rows = stmt
            .query_map([device], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut params = Vec::with_capacity(rows.len());
        for (index, name, period, spm) in rows {
            let (Some(period), Some(spm)) = (period, spm) else {
                return Ok(Vec::new());
            };
            let sample_period_ms = i32::try_from(period).map_err(|_| {
                RegistryError::InvalidRecord(format!("sample period {} out of range", period))
            })?;
            let samples_per_message = u8::try_from(spm)
                .ok()
                .filter(|n| (1..=MAX_SAMPLES_PER_MESSAGE).contains(n))
                .ok_or_else(|| {
                    RegistryError::InvalidRecord(format!("samples per message {} out of range", spm))
                })?;
            params.push(SensorParams {
                sample_period_ms,
                samples_per_message,
                name: name.unwrap_or_else(|| index.to_string()),
            });
        }
        Ok(params)
    }

    fn running_measurements(&self, device: DeviceId) -> Result<Vec<MeasurementRun>, RegistryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT p.name, m.id_in_project
             FROM control_center_measurement m
             JOIN control_center_project p ON p.id = m.project_id
             JOIN control_center_measurement_sensor_nodes l ON l.measurement_id = m.id
             WHERE l.sensornode_id = ?1 AND m.end_time IS NULL
             ORDER BY m.id ASC",
        )?;
        let runs = stmt
            .query_map([device], |row| {
                Ok(MeasurementRun {
                    name: row.get(0)?,
                    id: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    fn sensor_names(&self, device: DeviceId) -> Result<Vec<String>, RegistryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM control_center_sensor
             WHERE sensor_node_id = ?1 AND name IS NOT NULL AND name != ''
             ORDER BY id_in_sensor_node ASC",
        )?;
        let names = stmt
            .query_map([device], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn register_sensor(&self, device: DeviceId, name: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(id_in_sensor_node) + 1, 0)
             FROM control_center_sensor WHERE sensor_node_id = ?1",
            [device],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO control_center_sensor (sensor_node_id, id_in_sensor_node, name)
             VALUES (?1, ?2, ?3)",
            params![device, next, name],
        )?;
        tx.commit()?;

        info!(device, sensor = %name, "Sensor registered");
        Ok(())
    }

    fn set_connection_state(&self, device: DeviceId, connected: bool) -> Result<(), RegistryError> {
        let updated = self.conn.lock().execute(
            "UPDATE control_center_sensornode SET connected = ?1 WHERE id = ?2",
            params![connected, device],
        )?;
        if updated == 0 {
            return Err(RegistryError::UnknownDevice(device));
        }
        Ok(())
    }

    fn reset_connection_states(&self) -> Result<(), RegistryError> {
        self.conn
            .lock()
            .execute("UPDATE control_center_sensornode SET connected = 0", [])?;
        Ok(())
    }
}
