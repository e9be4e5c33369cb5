// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sensor node clock wraparound correction.
//!
//! Node timestamps are 32-bit milliseconds since boot and wrap after ~49.7
//! days. The unwrapper arms once a timestamp reaches the upper half of the
//! range and, when a later timestamp falls back below it (minus a margin for
//! slightly reordered samples), adds one full 2^32 span to its offset.
//! This assumes the device clock only ever jumps backwards by wrapping.

/// Timestamps at or above this arm the unwrapper.
pub const ARM_THRESHOLD: u32 = u32::MAX / 2;

/// Margin below [`ARM_THRESHOLD`] a timestamp must fall to count as a wrap.
pub const WRAP_MARGIN: u32 = 1000;

const SPAN: u64 = 1 << 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampUnwrapper {
    armed: bool,
    offset: u64,
}

impl TimestampUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Corrected device time in milliseconds for `raw`.
    ///
    /// Must be called for every sample in arrival order.
    pub fn correct(&mut self, raw: u32) -> u64 {
        if !self.armed && raw >= ARM_THRESHOLD {
            self.armed = true;
        } else if self.armed && raw < ARM_THRESHOLD - WRAP_MARGIN {
            self.armed = false;
            self.offset += SPAN;
        }
        self.offset + u64::from(raw)
    }

    /// Total correction applied so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn wraps(&self) -> u64 {
        self.offset / SPAN
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

/// One unwrapper per sensor channel.
///
/// Each channel's timestamps only move forward, but batches of different
/// channels overlap in time, so they never share wrap state.
#[derive(Debug, Clone, Default)]
pub struct SensorClocks {
    channels: Vec<TimestampUnwrapper>,
}

impl SensorClocks {
    pub fn new(sensor_count: usize) -> Self {
        Self {
            channels: vec![TimestampUnwrapper::new(); sensor_count],
        }
    }

    /// Corrected time for a sample of `sensor_id`, `None` for an unknown sensor.
    pub fn correct(&mut self, sensor_id: u8, raw: u32) -> Option<u64> {
        self.channels
            .get_mut(sensor_id as usize)
            .map(|channel| channel.correct(raw))
    }

    /// Wraps seen across all channels.
    pub fn wraps(&self) -> u64 {
        self.channels.iter().map(TimestampUnwrapper::wraps).sum()
    }
}
