// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! FBGuard session.
//!
//! FBGuard devices need no negotiation: every message names its sensor, and
//! sensors the registry has not seen yet are registered on first sighting.

use super::session::{Reading, SessionCore, SessionEnd, SessionError};
use crate::protocol::{guard, GuardMessage};
use crate::sink::Precision;
use std::collections::HashSet;
use std::time::Instant;
use tracing::debug;

pub struct GuardSession {
    core: SessionCore,
    known_sensors: HashSet<String>,
}

impl GuardSession {
    pub fn new(core: SessionCore) -> Self {
        Self {
            core,
            known_sensors: HashSet::new(),
        }
    }

    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    pub(crate) fn serve(&mut self) -> Result<SessionEnd, SessionError> {
        self.refresh_sensors()?;

        let max_message = self.core.ctx.settings.max_guard_message;
        let refresh_interval = self.core.ctx.settings.params_poll_interval;
        let mut last_refresh = Instant::now();

        // The identifying message is still pending, so frame before reading.
        loop {
            let (messages, consumed) = guard::frame_messages(self.core.conn.pending(), max_message)?;
            self.core.conn.consume(consumed);
            if !messages.is_empty() {
                self.handle(messages)?;
            }

            if last_refresh.elapsed() >= refresh_interval {
                self.refresh_sensors()?;
                last_refresh = Instant::now();
            }

            if !self.core.should_run() {
                return Ok(self.core.stop_reason());
            }
            if let Some(end) = self.core.receive()? {
                return Ok(end);
            }
        }
    }

    fn refresh_sensors(&mut self) -> Result<(), SessionError> {
        self.known_sensors = self
            .core
            .ctx
            .registry
            .sensor_names(self.core.device_id)?
            .into_iter()
            .collect();
        Ok(())
    }

    fn handle(&mut self, messages: Vec<GuardMessage>) -> Result<(), SessionError> {
        let message_count = messages.len();
        let mut readings = Vec::new();

        for message in messages {
            let sensor = message.header.sensor_id;
            if !self.known_sensors.contains(&sensor) {
                debug!(device = %self.core.name, sensor = %sensor, "New sensor");
                self.core
                    .ctx
                    .registry
                    .register_sensor(self.core.device_id, &sensor)?;
                self.known_sensors.insert(sensor.clone());
            }

            readings.extend(message.readouts.iter().map(|readout| Reading {
                sensor: sensor.clone(),
                timestamp: readout.timestamp_micros(),
                value: readout.value,
            }));
        }

        self.core
            .ctx
            .metrics
            .record_messages_decoded(message_count, readings.len());
        self.core.route(&readings, Precision::Microseconds)
    }
}
