// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device wire protocols.
//!
//! Two device families share one TCP port and are told apart by the first
//! bytes they send:
//!
//! ```text
//! sensor node : 0x01 (Info tag) | name_len | name | sensor_count | unix_time_offset
//! FBGuard     : 0x55 0x00 0x55 (sync) | header ... | readouts | checksum
//! ```
//!
//! All multi-byte fields are little-endian. Decoders never panic on short or
//! malformed input; a short buffer is reported as [`ProtocolError::Incomplete`]
//! and framers treat it as "wait for the next read".

pub mod guard;
pub mod node;
pub mod sample;

pub use guard::{GuardMessage, Header as GuardHeader};
pub use node::{ExpectedSizes, Info, NodeMessage, SensorSamples, SetSensorParams};
pub use sample::{Readout, Sample};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding or encoding device messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer bytes than the message declares. Framers defer instead of failing.
    #[error("incomplete message: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("bad sync bytes {0:02x?}")]
    BadSync([u8; 3]),

    #[error("unknown sensor id {0}")]
    UnknownSensor(u8),

    #[error("message size mismatch: declared {declared} bytes, expected {expected}")]
    SizeMismatch { declared: usize, expected: usize },

    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("invalid text field: {0}")]
    InvalidText(String),

    #[error("samples per message out of range: {0} (1..={max})", max = node::MAX_SAMPLES_PER_MESSAGE)]
    SamplesPerMessage(u16),

    #[error("too many sensors: {0} (max 256)")]
    TooManySensors(usize),

    #[error("field too long: {0} bytes")]
    FieldTooLong(usize),
}

/// Device family, as stored in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    /// Multi-sensor node with negotiated sampling parameters (family A).
    SensorNode,
    /// Fixed-header device multiplexing named sensors (family B).
    FbGuard,
}

impl DeviceFamily {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::SensorNode => 0,
            Self::FbGuard => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::SensorNode),
            1 => Some(Self::FbGuard),
            _ => None,
        }
    }

    /// Whether the registry owns the sensor list (and its parameters).
    pub fn manages_sensors(self) -> bool {
        matches!(self, Self::SensorNode)
    }
}

impl std::fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SensorNode => write!(f, "sensor-node"),
            Self::FbGuard => write!(f, "fbguard"),
        }
    }
}

/// Outcome of sniffing the first bytes of a new connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Identification {
    /// Not enough bytes yet to decide or to decode the first message.
    Pending,
    /// Leading bytes match no known family.
    Unrecognized,
    /// A sensor node announced itself; `consumed` bytes belong to the `Info`.
    SensorNode { info: Info, consumed: usize },
    /// An FBGuard device sent a complete first message. Nothing is consumed:
    /// the message stays buffered for the session's first framing pass.
    FbGuard { header: GuardHeader },
}

/// Identify the device family from the start of a connection's byte stream.
///
/// Returns an error when the family is recognised but its first message is
/// malformed.
pub fn identify(buf: &[u8], max_guard_message: usize) -> Result<Identification, ProtocolError> {
    let Some(&first) = buf.first() else {
        return Ok(Identification::Pending);
    };

    if first == node::TAG_INFO {
        return match Info::decode(buf) {
            Ok((info, consumed)) => Ok(Identification::SensorNode { info, consumed }),
            Err(ProtocolError::Incomplete { .. }) => Ok(Identification::Pending),
            Err(e) => Err(e),
        };
    }

    let sync_len = buf.len().min(guard::SYNC.len());
    if guard::SYNC.starts_with(&buf[..sync_len]) {
        let Some(size) = guard::expected_size(buf) else {
            return Ok(Identification::Pending);
        };
        guard::check_declared_size(size, max_guard_message)?;
        if buf.len() < size {
            return Ok(Identification::Pending);
        }
        let message = GuardMessage::decode(&buf[..size])?;
        return Ok(Identification::FbGuard {
            header: message.header,
        });
    }

    Ok(Identification::Unrecognized)
}
