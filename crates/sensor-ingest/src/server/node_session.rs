// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sensor node session.
//!
//! ```text
//! Info received -> wait for registry params -> push SetSensorParams -> stream
//! ```
//!
//! While streaming, the registry is re-read every poll interval; any change
//! to the negotiated parameters ends the session so the node reconnects and
//! negotiates again.

use super::overflow::SensorClocks;
use super::session::{Reading, SessionCore, SessionEnd, SessionError};
use crate::protocol::{ExpectedSizes, Info, ProtocolError, SensorSamples, SetSensorParams};
use crate::registry::SensorParams;
use crate::sink::Precision;
use std::time::Instant;
use tracing::{debug, info};

pub struct NodeSession {
    core: SessionCore,
    info: Info,
    clocks: SensorClocks,
}

impl NodeSession {
    pub fn new(core: SessionCore, info: Info) -> Self {
        Self {
            core,
            info,
            clocks: SensorClocks::default(),
        }
    }

    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    pub fn info(&self) -> &Info {
        &self.info
    }

    pub(crate) fn serve(&mut self) -> Result<SessionEnd, SessionError> {
        let Some(params) = self.negotiate()? else {
            return Ok(self.core.stop_reason());
        };
        let sizes = ExpectedSizes::from_params(&params)?;
        self.clocks = SensorClocks::new(params.len());

        let poll_interval = self.core.ctx.settings.params_poll_interval;
        let mut last_poll = Instant::now();
        debug!(device = %self.core.name, "Receiving samples");

        loop {
            let (batches, consumed) = sizes.frame_samples(self.core.conn.pending())?;
            self.core.conn.consume(consumed);
            if !batches.is_empty() {
                self.handle(batches, &params)?;
            }

            if last_poll.elapsed() >= poll_interval {
                let current = self.core.ctx.registry.sensor_params(self.core.device_id)?;
                if current != params {
                    info!(device = %self.core.name, "Sensor parameters changed, restarting session");
                    self.core.ctx.metrics.record_param_restart();
                    return Ok(SessionEnd::ParamsChanged);
                }
                last_poll = Instant::now();
            }

            if !self.core.should_run() {
                return Ok(self.core.stop_reason());
            }
            if let Some(end) = self.core.receive()? {
                return Ok(end);
            }
        }
    }

    /// Wait until the registry has parameters for every sensor, then push them.
    ///
    /// Returns `None` if the session was stopped while waiting.
    fn negotiate(&mut self) -> Result<Option<Vec<SensorParams>>, SessionError> {
        let poll_interval = self.core.ctx.settings.params_poll_interval;
        let mut waiting_logged = false;

        let params = loop {
            if !self.core.should_run() {
                return Ok(None);
            }
            let params = self.core.ctx.registry.sensor_params(self.core.device_id)?;
            if !params.is_empty() {
                break params;
            }
            if !waiting_logged {
                info!(device = %self.core.name, "Waiting for sensor parameters");
                waiting_logged = true;
            }
            std::thread::sleep(poll_interval);
        };

        let message = SetSensorParams::new(&params).encode()?;
        self.core.conn.send(&message)?;
        info!(
            device = %self.core.name,
            sensors = params.len(),
            "Sensor parameters sent"
        );
        Ok(Some(params))
    }

    fn handle(&mut self, batches: Vec<SensorSamples>, params: &[SensorParams]) -> Result<(), SessionError> {
        let batch_count = batches.len();
        let wraps_before = self.clocks.wraps();
        let mut readings = Vec::new();
        let mut nan_count = 0usize;

        for batch in batches {
            let sensor = params
                .get(batch.sensor_id as usize)
                .ok_or(ProtocolError::UnknownSensor(batch.sensor_id))?;
            for sample in batch.samples {
                let device_ms = self
                    .clocks
                    .correct(batch.sensor_id, sample.timestamp)
                    .ok_or(ProtocolError::UnknownSensor(batch.sensor_id))?;
                if sample.value.is_nan() {
                    nan_count += 1;
                }
                readings.push(Reading {
                    sensor: sensor.name.clone(),
                    timestamp: self.info.unix_time_offset.saturating_add(device_ms),
                    value: sample.value,
                });
            }
        }

        if self.clocks.wraps() != wraps_before {
            info!(device = %self.core.name, wraps = self.clocks.wraps(), "Device clock overflow");
        }
        if nan_count > 0 {
            debug!(device = %self.core.name, count = nan_count, "NaN value detected");
        }

        self.core
            .ctx
            .metrics
            .record_messages_decoded(batch_count, readings.len());
        self.core.route(&readings, Precision::Milliseconds)
    }
}
