// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! FBGuard protocol (family B).
//!
//! Every message is a fixed 80-byte header, `readout_count` readouts and a
//! 4-byte trailing checksum:
//!
//! ```text
//! 0      3    4             36            68        70        72          76         80
//! +------+----+-------------+-------------+---------+---------+-----------+----------+
//! | sync |type| device_id   | sensor_id   | counter | readouts| byte_size | checksum |
//! | 55 00 55  | 32B, NUL    | 32B, NUL    | u16     | u16     | u32       | 4B       |
//! +------+----+-------------+-------------+---------+---------+-----------+----------+
//! | readout_count x Readout (24 bytes)                                               |
//! +----------------------------------------------------------------------------------+
//! | packet checksum (4 bytes)                                                        |
//! +----------------------------------------------------------------------------------+
//! ```
//!
//! Checksums are carried through decode/encode untouched and never verified.

use super::sample::{read_array, read_u16_le, read_u32_le, Readout};
use super::ProtocolError;

pub const SYNC: [u8; 3] = [0x55, 0x00, 0x55];
pub const HEADER_SIZE: usize = 80;
pub const CHECKSUM_SIZE: usize = 4;
/// Bytes needed before the declared message size can be read.
pub const SIZE_FIELD_END: usize = 76;
/// Readouts accepted by [`GuardMessage::build`].
pub const MAX_READOUTS: usize = 1024;

const ID_FIELD_SIZE: usize = 32;
const DEVICE_ID_OFFSET: usize = 4;
const SENSOR_ID_OFFSET: usize = 36;
const COUNTER_OFFSET: usize = 68;
const COUNT_OFFSET: usize = 70;
const SIZE_OFFSET: usize = 72;
const CHECKSUM_OFFSET: usize = 76;

/// Total size of a message carrying `readout_count` readouts.
pub fn message_size(readout_count: usize) -> usize {
    HEADER_SIZE + readout_count * Readout::SIZE + CHECKSUM_SIZE
}

/// Declared total message size, once the size field has arrived.
pub fn expected_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < SIZE_FIELD_END {
        return None;
    }
    Some(read_u32_le(buf, SIZE_OFFSET) as usize)
}

/// Reject declared sizes that cannot be a message or exceed `max`.
pub fn check_declared_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::TooLarge { size, max });
    }
    if size < message_size(0) {
        return Err(ProtocolError::SizeMismatch {
            declared: size,
            expected: message_size(0),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub packet_type: u8,
    pub device_id: String,
    pub sensor_id: String,
    pub packet_counter: u16,
    pub readout_count: u16,
    pub byte_size: u32,
    pub checksum: [u8; 4],
}

impl Header {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::Incomplete {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }
        let sync: [u8; 3] = read_array(buf, 0);
        if sync != SYNC {
            return Err(ProtocolError::BadSync(sync));
        }

        Ok(Self {
            packet_type: buf[3],
            device_id: read_id(&buf[DEVICE_ID_OFFSET..DEVICE_ID_OFFSET + ID_FIELD_SIZE])?,
            sensor_id: read_id(&buf[SENSOR_ID_OFFSET..SENSOR_ID_OFFSET + ID_FIELD_SIZE])?,
            packet_counter: read_u16_le(buf, COUNTER_OFFSET),
            readout_count: read_u16_le(buf, COUNT_OFFSET),
            byte_size: read_u32_le(buf, SIZE_OFFSET),
            checksum: read_array(buf, CHECKSUM_OFFSET),
        })
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&SYNC);
        buf.push(self.packet_type);
        write_id(buf, &self.device_id);
        write_id(buf, &self.sensor_id);
        buf.extend_from_slice(&self.packet_counter.to_le_bytes());
        buf.extend_from_slice(&self.readout_count.to_le_bytes());
        buf.extend_from_slice(&self.byte_size.to_le_bytes());
        buf.extend_from_slice(&self.checksum);
    }
}

/// One FBGuard packet: a header and the readouts of a single sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardMessage {
    pub header: Header,
    pub readouts: Vec<Readout>,
    pub checksum: [u8; 4],
}

impl GuardMessage {
    /// Build a message with a consistent header and zeroed checksums.
    ///
    /// Identifiers longer than 31 bytes are truncated on encode.
    pub fn build(
        device_id: impl Into<String>,
        sensor_id: impl Into<String>,
        packet_counter: u16,
        readouts: Vec<Readout>,
    ) -> Result<Self, ProtocolError> {
        if readouts.len() > MAX_READOUTS {
            return Err(ProtocolError::FieldTooLong(readouts.len()));
        }
        let byte_size = message_size(readouts.len());
        Ok(Self {
            header: Header {
                packet_type: 0,
                device_id: device_id.into(),
                sensor_id: sensor_id.into(),
                packet_counter,
                readout_count: readouts.len() as u16,
                byte_size: byte_size as u32,
                checksum: [0; 4],
            },
            readouts,
            checksum: [0; 4],
        })
    }

    pub fn size(&self) -> usize {
        message_size(self.readouts.len())
    }

    /// Decode a complete message from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::decode(buf)?;
        let size = message_size(header.readout_count as usize);
        if header.byte_size as usize != size {
            return Err(ProtocolError::SizeMismatch {
                declared: header.byte_size as usize,
                expected: size,
            });
        }
        if buf.len() < size {
            return Err(ProtocolError::Incomplete {
                needed: size,
                available: buf.len(),
            });
        }

        let data_end = size - CHECKSUM_SIZE;
        let readouts = buf[HEADER_SIZE..data_end]
            .chunks_exact(Readout::SIZE)
            .map(Readout::decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            header,
            readouts,
            checksum: read_array(buf, data_end),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.header.encode_into(&mut buf);
        for readout in &self.readouts {
            readout.encode_into(&mut buf);
        }
        buf.extend_from_slice(&self.checksum);
        buf
    }
}

/// Extract every complete message at the front of `buf`.
///
/// Returns the messages and the number of bytes they occupy.
pub fn frame_messages(
    buf: &[u8],
    max_message: usize,
) -> Result<(Vec<GuardMessage>, usize), ProtocolError> {
    let mut messages = Vec::new();
    let mut offset = 0;

    loop {
        let rest = &buf[offset..];
        // Lost sync is reported before waiting on a size read from garbage.
        if rest.len() >= SYNC.len() && rest[..SYNC.len()] != SYNC {
            return Err(ProtocolError::BadSync(read_array(rest, 0)));
        }
        let Some(size) = expected_size(rest) else {
            break;
        };
        check_declared_size(size, max_message)?;
        if rest.len() < size {
            break;
        }
        messages.push(GuardMessage::decode(&rest[..size])?);
        offset += size;
    }

    Ok((messages, offset))
}

fn read_id(field: &[u8]) -> Result<String, ProtocolError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(str::to_string)
        .map_err(|e| ProtocolError::InvalidText(e.to_string()))
}

fn write_id(buf: &mut Vec<u8>, id: &str) {
    // Keep the terminating NUL and never split a UTF-8 sequence.
    let mut end = id.len().min(ID_FIELD_SIZE - 1);
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    buf.extend_from_slice(&id.as_bytes()[..end]);
    buf.resize(buf.len() + ID_FIELD_SIZE - end, 0);
}
