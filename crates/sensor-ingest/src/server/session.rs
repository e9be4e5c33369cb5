// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device sessions.
//!
//! A session owns one identified device connection until it disconnects,
//! times out, is preempted by a newer connection for the same device, or
//! stops itself after a configuration change. Family specific loops live in
//! [`super::node_session`] and [`super::guard_session`]; this module holds
//! what they share: registry bookkeeping, routing into the sink and teardown.

use super::connection::{ConnectionError, DeviceConnection, ReadOutcome};
use super::guard_session::GuardSession;
use super::node_session::NodeSession;
use super::sessions::{SessionTable, SessionTicket};
use crate::metrics::IngestMetrics;
use crate::protocol::{DeviceFamily, GuardHeader, Info, ProtocolError};
use crate::registry::{DeviceId, Registry, RegistryError};
use crate::sink::{Precision, Sink, SinkError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, trace, warn};

/// Timing and size limits applied to every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub read_timeout: Duration,
    pub idle_timeout: Duration,
    pub params_poll_interval: Duration,
    pub max_guard_message: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            params_poll_interval: Duration::from_secs(1),
            max_guard_message: 1024 * 1024,
        }
    }
}

/// Collaborators shared by all sessions of a server.
pub struct SessionContext {
    pub registry: Arc<dyn Registry>,
    pub sink: Arc<dyn Sink>,
    pub sessions: Arc<SessionTable>,
    pub metrics: Arc<IngestMetrics>,
    pub settings: SessionSettings,
    pub shutdown: Arc<AtomicBool>,
}

impl SessionContext {
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Server shutdown.
    Stopped,
    /// A newer connection claimed the device name.
    Preempted,
    /// The device closed the connection.
    Disconnected,
    /// Registry parameters no longer match the negotiated ones.
    ParamsChanged,
    /// No data for longer than the idle timeout.
    IdleTimeout,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Preempted => write!(f, "preempted"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::ParamsChanged => write!(f, "parameters changed"),
            Self::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

/// Session error types. Every error tears the session down.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("sink: {0}")]
    Sink(#[from] SinkError),
}

/// One decoded sample on its way to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub sensor: String,
    pub timestamp: u64,
    pub value: f64,
}

/// State shared by both session families.
pub struct SessionCore {
    pub(crate) ctx: Arc<SessionContext>,
    pub(crate) conn: DeviceConnection,
    pub(crate) name: String,
    pub(crate) device_id: DeviceId,
    pub(crate) family: DeviceFamily,
    ticket: SessionTicket,
}

impl SessionCore {
    /// Claim the device name and mark the device connected.
    pub fn open(
        ctx: Arc<SessionContext>,
        conn: DeviceConnection,
        name: String,
        device_id: DeviceId,
        family: DeviceFamily,
    ) -> Result<Self, SessionError> {
        let ticket = ctx.sessions.claim(&name);
        if ticket.preempted_other() {
            ctx.metrics.record_preemption();
        }
        conn.set_read_timeout(ctx.settings.read_timeout)
            .map_err(ConnectionError::from)?;
        ctx.registry.set_connection_state(device_id, true)?;
        ctx.metrics.record_session_started();

        info!(device = %name, peer = %conn.peer_addr(), %family, "Device identified");
        Ok(Self {
            ctx,
            conn,
            name,
            device_id,
            family,
            ticket,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn should_run(&self) -> bool {
        self.ticket.control().is_running() && !self.ctx.is_shutting_down()
    }

    /// Reason to report once [`Self::should_run`] turned false.
    pub fn stop_reason(&self) -> SessionEnd {
        if self.ticket.control().was_preempted() {
            SessionEnd::Preempted
        } else {
            SessionEnd::Stopped
        }
    }

    /// Read once; `Some` ends the session.
    pub fn receive(&mut self) -> Result<Option<SessionEnd>, SessionError> {
        match self.conn.fill()? {
            ReadOutcome::Data(n) => {
                self.ctx.metrics.record_bytes_received(n);
                Ok(None)
            }
            ReadOutcome::Closed => Ok(Some(SessionEnd::Disconnected)),
            ReadOutcome::TimedOut if self.conn.idle_for() >= self.ctx.settings.idle_timeout => {
                Ok(Some(SessionEnd::IdleTimeout))
            }
            ReadOutcome::TimedOut => Ok(None),
        }
    }

    /// Send `readings` to every measurement run recording this device.
    ///
    /// Readings are dropped when no run is active.
    pub fn route(&self, readings: &[Reading], precision: Precision) -> Result<(), SessionError> {
        if readings.is_empty() {
            return Ok(());
        }

        let runs = self.ctx.registry.running_measurements(self.device_id)?;
        if runs.is_empty() {
            trace!(device = %self.name, samples = readings.len(), "No running measurement, samples dropped");
            self.ctx.metrics.record_samples_dropped(readings.len());
            return Ok(());
        }

        let sink = &self.ctx.sink;
        for run in &runs {
            let points = readings
                .iter()
                .map(|r| sink.make_point(run.id, &self.name, &r.sensor, r.timestamp, r.value, precision))
                .collect::<Vec<_>>();
            let count = points.len();
            if let Err(e) = sink.write_batch(&run.name, points) {
                self.ctx.metrics.record_sink_error();
                return Err(e.into());
            }
            self.ctx.metrics.record_points_written(count);
        }
        Ok(())
    }

    pub(crate) fn record_protocol_error(&self) {
        self.ctx.metrics.record_protocol_error();
    }

    /// Release registry state after the session loop returned.
    fn finish(&self, outcome: &Result<SessionEnd, SessionError>) {
        self.ctx.metrics.record_session_ended();

        release_connection_state(self.ctx.registry.as_ref(), self.device_id, &self.ticket);

        match outcome {
            Ok(end) => info!(
                device = %self.name,
                peer = %self.conn.peer_addr(),
                bytes = self.conn.bytes_received(),
                "Session ended: {}", end
            ),
            Err(e) => warn!(
                device = %self.name,
                peer = %self.conn.peer_addr(),
                bytes = self.conn.bytes_received(),
                "Session failed: {}", e
            ),
        }
    }
}

/// Mark the device disconnected unless a newer session owns it.
///
/// A newer session claims the name before it marks the device connected, so
/// a preemption seen after the write means that write may have been
/// overwritten and must be restored.
fn release_connection_state(registry: &dyn Registry, device_id: DeviceId, ticket: &SessionTicket) {
    let control = ticket.control();
    if control.was_preempted() {
        return;
    }
    if let Err(e) = registry.set_connection_state(device_id, false) {
        warn!(device = %ticket.name(), "Failed to mark device disconnected: {}", e);
    }
    if control.was_preempted() && ticket.name_held_by_other() {
        if let Err(e) = registry.set_connection_state(device_id, true) {
            warn!(device = %ticket.name(), "Failed to restore connection state: {}", e);
        }
    }
}

/// A live device session, one variant per device family.
pub enum DeviceSession {
    Node(NodeSession),
    Guard(GuardSession),
}

impl DeviceSession {
    /// Register a sensor node announced by `info` and open its session.
    pub fn open_node(
        ctx: Arc<SessionContext>,
        conn: DeviceConnection,
        info: Info,
    ) -> Result<Self, SessionError> {
        let device_id = ctx.registry.resolve_or_register_device(
            &info.name,
            DeviceFamily::SensorNode,
            Some(info.sensor_count),
        )?;
        let core = SessionCore::open(ctx, conn, info.name.clone(), device_id, DeviceFamily::SensorNode)?;
        Ok(Self::Node(NodeSession::new(core, info)))
    }

    /// Register the FBGuard device named in `header` and open its session.
    ///
    /// The first message must still be pending in `conn`.
    pub fn open_guard(
        ctx: Arc<SessionContext>,
        conn: DeviceConnection,
        header: &GuardHeader,
    ) -> Result<Self, SessionError> {
        let device_id =
            ctx.registry
                .resolve_or_register_device(&header.device_id, DeviceFamily::FbGuard, None)?;
        let core = SessionCore::open(
            ctx,
            conn,
            header.device_id.clone(),
            device_id,
            DeviceFamily::FbGuard,
        )?;
        Ok(Self::Guard(GuardSession::new(core)))
    }

    pub fn core(&self) -> &SessionCore {
        match self {
            Self::Node(s) => s.core(),
            Self::Guard(s) => s.core(),
        }
    }

    pub fn family(&self) -> DeviceFamily {
        self.core().family
    }

    /// Run the session to completion and release its registry state.
    pub fn run(mut self) -> Result<SessionEnd, SessionError> {
        let outcome = match &mut self {
            Self::Node(s) => s.serve(),
            Self::Guard(s) => s.serve(),
        };
        if matches!(outcome, Err(SessionError::Protocol(_))) {
            self.core().record_protocol_error();
        }
        self.core().finish(&outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MeasurementRun, MemoryRegistry, SensorParams};
    use parking_lot::Mutex;

    /// Lets a newer session claim the device and mark it connected right
    /// before the older session's disconnect write lands.
    struct TakeoverRegistry {
        inner: MemoryRegistry,
        table: Arc<SessionTable>,
        newer: Mutex<Option<SessionTicket>>,
    }

    impl Registry for TakeoverRegistry {
        fn resolve_or_register_device(
            &self,
            name: &str,
            family: DeviceFamily,
            sensor_count: Option<u8>,
        ) -> Result<DeviceId, RegistryError> {
            self.inner.resolve_or_register_device(name, family, sensor_count)
        }

        fn sensor_params(&self, device: DeviceId) -> Result<Vec<SensorParams>, RegistryError> {
            self.inner.sensor_params(device)
        }

        fn running_measurements(&self, device: DeviceId) -> Result<Vec<MeasurementRun>, RegistryError> {
            self.inner.running_measurements(device)
        }

        fn sensor_names(&self, device: DeviceId) -> Result<Vec<String>, RegistryError> {
            self.inner.sensor_names(device)
        }

        fn register_sensor(&self, device: DeviceId, name: &str) -> Result<(), RegistryError> {
            self.inner.register_sensor(device, name)
        }

        fn set_connection_state(&self, device: DeviceId, connected: bool) -> Result<(), RegistryError> {
            if !connected {
                let mut newer = self.newer.lock();
                if newer.is_none() {
                    *newer = Some(self.table.claim("dev1"));
                    self.inner.set_connection_state(device, true)?;
                }
            }
            self.inner.set_connection_state(device, connected)
        }

        fn reset_connection_states(&self) -> Result<(), RegistryError> {
            self.inner.reset_connection_states()
        }
    }

    #[test]
    fn test_disconnect_keeps_device_connected_for_newer_session() {
        let table = Arc::new(SessionTable::new());
        let registry = TakeoverRegistry {
            inner: MemoryRegistry::new(),
            table: table.clone(),
            newer: Mutex::new(None),
        };
        let id = registry.inner.seed_device("dev1", DeviceFamily::FbGuard, &[]);
        let old = table.claim("dev1");
        registry.inner.set_connection_state(id, true).unwrap();

        release_connection_state(&registry, id, &old);

        assert!(old.control().was_preempted());
        assert!(registry.newer.lock().is_some());
        assert_eq!(registry.inner.is_connected(id), Some(true));
    }

    #[test]
    fn test_disconnect_without_newer_session() {
        let table = Arc::new(SessionTable::new());
        let registry = MemoryRegistry::new();
        let id = registry.seed_device("dev1", DeviceFamily::FbGuard, &[]);
        let ticket = table.claim("dev1");
        registry.set_connection_state(id, true).unwrap();

        release_connection_state(&registry, id, &ticket);
        assert_eq!(registry.is_connected(id), Some(false));
    }

    #[test]
    fn test_preempted_session_leaves_state_alone() {
        let table = Arc::new(SessionTable::new());
        let registry = MemoryRegistry::new();
        let id = registry.seed_device("dev1", DeviceFamily::FbGuard, &[]);
        let old = table.claim("dev1");
        let _newer = table.claim("dev1");
        registry.set_connection_state(id, true).unwrap();

        release_connection_state(&registry, id, &old);
        assert_eq!(registry.is_connected(id), Some(true));
    }
}
