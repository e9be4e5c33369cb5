// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-size measurement records shared by both device families.
//!
//! ```text
//! Sample (sensor node, 12 bytes, little-endian)
//! +-------------------+---------------------------+
//! | timestamp (u32)   | value (f64)               |
//! +-------------------+---------------------------+
//!
//! Readout (FBGuard, 24 bytes, little-endian)
//! +-------------------+-------------------+-------------------+
//! | seconds (u64)     | microseconds (u64)| value (f64)       |
//! +-------------------+-------------------+-------------------+
//! ```

use super::ProtocolError;

/// One timestamped measurement from a sensor node.
///
/// `timestamp` is milliseconds since device boot and wraps at 2^32.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: u32,
    pub value: f64,
}

impl Sample {
    /// Encoded size in bytes.
    pub const SIZE: usize = 12;

    pub fn new(timestamp: u32, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Decode a sample from the first [`Sample::SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::Incomplete {
                needed: Self::SIZE,
                available: buf.len(),
            });
        }
        Ok(Self {
            timestamp: read_u32_le(buf, 0),
            value: f64::from_le_bytes(read_array(buf, 4)),
        })
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());
    }
}

/// One timestamped measurement from an FBGuard device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Readout {
    pub seconds: u64,
    pub microseconds: u64,
    pub value: f64,
}

impl Readout {
    /// Encoded size in bytes.
    pub const SIZE: usize = 24;

    pub fn new(seconds: u64, microseconds: u64, value: f64) -> Self {
        Self {
            seconds,
            microseconds,
            value,
        }
    }

    /// Decode a readout from the first [`Readout::SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::Incomplete {
                needed: Self::SIZE,
                available: buf.len(),
            });
        }
        Ok(Self {
            seconds: u64::from_le_bytes(read_array(buf, 0)),
            microseconds: u64::from_le_bytes(read_array(buf, 8)),
            value: f64::from_le_bytes(read_array(buf, 16)),
        })
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.seconds.to_le_bytes());
        buf.extend_from_slice(&self.microseconds.to_le_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());
    }

    /// Absolute timestamp in microseconds since the Unix epoch.
    pub fn timestamp_micros(&self) -> u64 {
        self.seconds
            .saturating_mul(1_000_000)
            .saturating_add(self.microseconds)
    }
}

// Callers check lengths before reading.
pub(crate) fn read_array<const N: usize>(buf: &[u8], off: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[off..off + N]);
    out
}

pub(crate) fn read_u16_le(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(read_array(buf, off))
}

pub(crate) fn read_u32_le(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(read_array(buf, off))
}
