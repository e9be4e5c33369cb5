// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sensor node protocol (family A).
//!
//! Device to server messages start with a one-byte tag:
//!
//! ```text
//! KeepAlive     : 0x00
//! Info          : 0x01 | name_len (u8) | name | sensor_count (u8) | unix_time_offset (u64)
//! SensorSamples : 0x02 | sensor_id (u8) | count (u8) | count x Sample (12 bytes)
//! Ack           : 0x03 | sensor_id (u8)
//! ```
//!
//! The server answers the `Info` with a single `SetSensorParams` blob: one
//! `sample_period_ms (i32) | samples_per_message (u8)` record per sensor, in
//! sensor-id order, with no tag or length prefix.
//!
//! After that the node only streams untagged sample frames:
//!
//! ```text
//! sensor_id (u8) | samples_per_message x Sample (12 bytes)
//! ```
//!
//! The frame length depends on the sensor, so the stream is cut with an
//! [`ExpectedSizes`] table derived from the negotiated parameters and a frame
//! is only decoded once it is complete.

use super::sample::{read_array, Sample};
use super::ProtocolError;
use serde::{Deserialize, Serialize};

pub const TAG_KEEP_ALIVE: u8 = 0x00;
pub const TAG_INFO: u8 = 0x01;
pub const TAG_SENSOR_SAMPLES: u8 = 0x02;
pub const TAG_ACK: u8 = 0x03;

/// Upper bound accepted by the firmware for one sample batch.
pub const MAX_SAMPLES_PER_MESSAGE: u8 = 121;

/// Tag + sensor id + sample count of a tagged `SensorSamples` message.
pub const SAMPLES_HEADER_SIZE: usize = 3;

/// Sensor id leading a stream frame.
pub const FRAME_HEADER_SIZE: usize = 1;

/// Size of one `SetSensorParams` record.
pub const PARAMS_RECORD_SIZE: usize = 5;

const INFO_OFFSET_SIZE: usize = 8;

/// Sampling contract for one sensor channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorParams {
    pub sample_period_ms: i32,
    pub samples_per_message: u8,
    pub name: String,
}

impl SensorParams {
    pub fn new(sample_period_ms: i32, samples_per_message: u8, name: impl Into<String>) -> Self {
        Self {
            sample_period_ms,
            samples_per_message,
            name: name.into(),
        }
    }
}

/// Identity announcement sent by a node right after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub sensor_count: u8,
    /// Wall-clock milliseconds at device time zero.
    pub unix_time_offset: u64,
}

impl Info {
    pub fn new(name: impl Into<String>, sensor_count: u8, unix_time_offset: u64) -> Self {
        Self {
            name: name.into(),
            sensor_count,
            unix_time_offset,
        }
    }

    /// Total frame length, once the name length byte is available.
    pub fn frame_len(buf: &[u8]) -> Option<usize> {
        buf.get(1)
            .map(|&name_len| 2 + name_len as usize + 1 + INFO_OFFSET_SIZE)
    }

    /// Decode an `Info` from the start of `buf`, returning it with its length.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        expect_tag(buf, TAG_INFO)?;
        let total = Self::frame_len(buf).ok_or(ProtocolError::Incomplete {
            needed: 2,
            available: buf.len(),
        })?;
        if buf.len() < total {
            return Err(ProtocolError::Incomplete {
                needed: total,
                available: buf.len(),
            });
        }

        let name_end = 2 + buf[1] as usize;
        let name = std::str::from_utf8(&buf[2..name_end])
            .map_err(|e| ProtocolError::InvalidText(e.to_string()))?
            .to_string();
        let sensor_count = buf[name_end];
        let unix_time_offset = u64::from_le_bytes(read_array(buf, name_end + 1));

        Ok((
            Self {
                name,
                sensor_count,
                unix_time_offset,
            },
            total,
        ))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let name = self.name.as_bytes();
        let name_len = u8::try_from(name.len()).map_err(|_| ProtocolError::FieldTooLong(name.len()))?;

        let mut buf = Vec::with_capacity(2 + name.len() + 1 + INFO_OFFSET_SIZE);
        buf.push(TAG_INFO);
        buf.push(name_len);
        buf.extend_from_slice(name);
        buf.push(self.sensor_count);
        buf.extend_from_slice(&self.unix_time_offset.to_le_bytes());
        Ok(buf)
    }
}

/// One sensor's batch of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSamples {
    pub sensor_id: u8,
    pub samples: Vec<Sample>,
}

impl SensorSamples {
    pub fn new(sensor_id: u8, samples: Vec<Sample>) -> Self {
        Self { sensor_id, samples }
    }

    /// Tagged message length of a batch carrying `sample_count` samples.
    pub fn expected_size(sample_count: usize) -> usize {
        SAMPLES_HEADER_SIZE + sample_count * Sample::SIZE
    }

    /// Stream frame length of a batch carrying `sample_count` samples.
    pub fn frame_size(sample_count: usize) -> usize {
        FRAME_HEADER_SIZE + sample_count * Sample::SIZE
    }

    /// Decode a stream frame spanning all of `frame`.
    pub fn decode_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        let Some((&sensor_id, body)) = frame.split_first() else {
            return Err(ProtocolError::Incomplete {
                needed: FRAME_HEADER_SIZE,
                available: 0,
            });
        };
        if body.len() % Sample::SIZE != 0 {
            return Err(ProtocolError::SizeMismatch {
                declared: frame.len(),
                expected: Self::frame_size(body.len() / Sample::SIZE + 1),
            });
        }

        let samples = body
            .chunks_exact(Sample::SIZE)
            .map(Sample::decode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sensor_id, samples })
    }

    pub fn encode_frame(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::frame_size(self.samples.len()));
        buf.push(self.sensor_id);
        for sample in &self.samples {
            sample.encode_into(&mut buf);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        expect_tag(buf, TAG_SENSOR_SAMPLES)?;
        if buf.len() < SAMPLES_HEADER_SIZE {
            return Err(ProtocolError::Incomplete {
                needed: SAMPLES_HEADER_SIZE,
                available: buf.len(),
            });
        }
        let sensor_id = buf[1];
        let count = buf[2] as usize;
        let total = Self::expected_size(count);
        if buf.len() < total {
            return Err(ProtocolError::Incomplete {
                needed: total,
                available: buf.len(),
            });
        }

        let samples = buf[SAMPLES_HEADER_SIZE..total]
            .chunks_exact(Sample::SIZE)
            .map(Sample::decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((Self { sensor_id, samples }, total))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let count = u8::try_from(self.samples.len())
            .map_err(|_| ProtocolError::FieldTooLong(self.samples.len()))?;

        let mut buf = Vec::with_capacity(Self::expected_size(self.samples.len()));
        buf.push(TAG_SENSOR_SAMPLES);
        buf.push(self.sensor_id);
        buf.push(count);
        for sample in &self.samples {
            sample.encode_into(&mut buf);
        }
        Ok(buf)
    }
}

/// Device to server message.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeMessage {
    KeepAlive,
    Info(Info),
    SensorSamples(SensorSamples),
    Ack { sensor_id: u8 },
}

impl NodeMessage {
    pub fn tag(&self) -> u8 {
        match self {
            Self::KeepAlive => TAG_KEEP_ALIVE,
            Self::Info(_) => TAG_INFO,
            Self::SensorSamples(_) => TAG_SENSOR_SAMPLES,
            Self::Ack { .. } => TAG_ACK,
        }
    }

    /// Decode one message from the start of `buf`, dispatching on its tag.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let Some(&tag) = buf.first() else {
            return Err(ProtocolError::Incomplete {
                needed: 1,
                available: 0,
            });
        };
        match tag {
            TAG_KEEP_ALIVE => Ok((Self::KeepAlive, 1)),
            TAG_INFO => Info::decode(buf).map(|(info, n)| (Self::Info(info), n)),
            TAG_SENSOR_SAMPLES => {
                SensorSamples::decode(buf).map(|(samples, n)| (Self::SensorSamples(samples), n))
            }
            TAG_ACK => match buf.get(1) {
                Some(&sensor_id) => Ok((Self::Ack { sensor_id }, 2)),
                None => Err(ProtocolError::Incomplete {
                    needed: 2,
                    available: buf.len(),
                }),
            },
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::KeepAlive => Ok(vec![TAG_KEEP_ALIVE]),
            Self::Info(info) => info.encode(),
            Self::SensorSamples(samples) => samples.encode(),
            Self::Ack { sensor_id } => Ok(vec![TAG_ACK, *sensor_id]),
        }
    }
}

/// Server to device parameter push.
#[derive(Debug, Clone, Copy)]
pub struct SetSensorParams<'a> {
    params: &'a [SensorParams],
}

impl<'a> SetSensorParams<'a> {
    pub fn new(params: &'a [SensorParams]) -> Self {
        Self { params }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.params.len() > 256 {
            return Err(ProtocolError::TooManySensors(self.params.len()));
        }

        let mut buf = Vec::with_capacity(self.params.len() * PARAMS_RECORD_SIZE);
        for params in self.params {
            let spm = params.samples_per_message;
            if spm == 0 || spm > MAX_SAMPLES_PER_MESSAGE {
                return Err(ProtocolError::SamplesPerMessage(spm as u16));
            }
            buf.extend_from_slice(&params.sample_period_ms.to_le_bytes());
            buf.push(spm);
        }
        Ok(buf)
    }
}

/// Per-sensor stream frame sizes, indexed by sensor id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedSizes {
    sizes: Vec<usize>,
}

impl ExpectedSizes {
    pub fn from_params(params: &[SensorParams]) -> Result<Self, ProtocolError> {
        if params.len() > 256 {
            return Err(ProtocolError::TooManySensors(params.len()));
        }
        Ok(Self {
            sizes: params
                .iter()
                .map(|p| SensorSamples::frame_size(p.samples_per_message as usize))
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn get(&self, sensor_id: u8) -> Option<usize> {
        self.sizes.get(sensor_id as usize).copied()
    }

    /// Extract every complete sample frame at the front of `buf`.
    ///
    /// Returns the batches and the number of bytes they occupy; the caller
    /// keeps `buf[consumed..]` for the next pass. A leading byte that is not
    /// a negotiated sensor id fails at once, before the frame is complete.
    pub fn frame_samples(&self, buf: &[u8]) -> Result<(Vec<SensorSamples>, usize), ProtocolError> {
        let mut batches = Vec::new();
        let mut offset = 0;

        while let Some(&sensor_id) = buf.get(offset) {
            let len = self
                .get(sensor_id)
                .ok_or(ProtocolError::UnknownSensor(sensor_id))?;
            if buf.len() - offset < len {
                break;
            }
            batches.push(SensorSamples::decode_frame(&buf[offset..offset + len])?);
            offset += len;
        }

        Ok((batches, offset))
    }
}

fn expect_tag(buf: &[u8], tag: u8) -> Result<(), ProtocolError> {
    match buf.first() {
        Some(&t) if t == tag => Ok(()),
        Some(&t) => Err(ProtocolError::UnknownTag(t)),
        None => Err(ProtocolError::Incomplete {
            needed: 1,
            available: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Vec<SensorParams> {
        vec![
            SensorParams::new(100, 10, "temp"),
            SensorParams::new(200, 5, "hum"),
        ]
    }

    fn batch(sensor_id: u8, count: usize, start: u32) -> SensorSamples {
        SensorSamples::new(
            sensor_id,
            (0..count as u32)
                .map(|i| Sample::new(start + i * 100, f64::from(i) * 0.5))
                .collect(),
        )
    }

    #[test]
    fn test_info_layout() {
        let bytes = Info::new("node1", 2, 1000).encode().unwrap();
        assert_eq!(bytes[0], TAG_INFO);
        assert_eq!(bytes[1], 5);
        assert_eq!(&bytes[2..7], b"node1");
        assert_eq!(bytes[7], 2);
        assert_eq!(&bytes[8..], &1000u64.to_le_bytes());

        let (info, used) = Info::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(info.name, "node1");
        assert_eq!(info.unix_time_offset, 1000);
    }

    #[test]
    fn test_info_invalid_utf8() {
        let mut bytes = Info::new("ab", 1, 0).encode().unwrap();
        bytes[2] = 0xff;
        assert!(matches!(
            Info::decode(&bytes),
            Err(ProtocolError::InvalidText(_))
        ));
    }

    #[test]
    fn test_sensor_samples_roundtrip() {
        let original = batch(1, 5, 4_000);
        let bytes = original.encode().unwrap();
        assert_eq!(bytes.len(), 3 + 5 * 12);

        let (decoded, used) = SensorSamples::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_sensor_samples_every_prefix_is_incomplete() {
        let bytes = batch(0, 4, 0).encode().unwrap();
        for cut in 0..bytes.len() {
            match SensorSamples::decode(&bytes[..cut]) {
                Err(ProtocolError::Incomplete { .. }) => {}
                other => panic!("prefix {} decoded to {:?}", cut, other),
            }
        }
    }

    #[test]
    fn test_set_sensor_params_encoding() {
        let params = params();
        let bytes = SetSensorParams::new(&params).encode().unwrap();
        assert_eq!(
            bytes,
            vec![100, 0, 0, 0, 10, 200, 0, 0, 0, 5],
            "two 5-byte records in sensor order"
        );
    }

    #[test]
    fn test_set_sensor_params_rejects_out_of_range() {
        let zero = vec![SensorParams::new(100, 0, "a")];
        assert_eq!(
            SetSensorParams::new(&zero).encode(),
            Err(ProtocolError::SamplesPerMessage(0))
        );

        let big = vec![SensorParams::new(100, 122, "a")];
        assert_eq!(
            SetSensorParams::new(&big).encode(),
            Err(ProtocolError::SamplesPerMessage(122))
        );
    }

    #[test]
    fn test_node_message_dispatch() {
        let messages = vec![
            NodeMessage::KeepAlive,
            NodeMessage::Info(Info::new("n", 1, 7)),
            NodeMessage::SensorSamples(batch(1, 2, 0)),
            NodeMessage::Ack { sensor_id: 1 },
        ];
        let mut buf = Vec::new();
        for m in &messages {
            buf.extend_from_slice(&m.encode().unwrap());
        }

        let mut offset = 0;
        for expected in &messages {
            let (decoded, used) = NodeMessage::decode(&buf[offset..]).unwrap();
            assert_eq!(&decoded, expected);
            assert_eq!(decoded.tag(), buf[offset]);
            offset += used;
        }
        assert_eq!(offset, buf.len());
        assert_eq!(
            NodeMessage::decode(&[0x42]),
            Err(ProtocolError::UnknownTag(0x42))
        );
    }

    #[test]
    fn test_sample_frame_layout() {
        let original = batch(1, 3, 500);
        let bytes = original.encode_frame();
        assert_eq!(bytes.len(), 1 + 3 * 12);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &500u32.to_le_bytes());
        assert_eq!(SensorSamples::decode_frame(&bytes).unwrap(), original);

        assert!(matches!(
            SensorSamples::decode_frame(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_expected_sizes_table() {
        let sizes = ExpectedSizes::from_params(&params()).unwrap();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes.get(0), Some(1 + 10 * 12));
        assert_eq!(sizes.get(1), Some(1 + 5 * 12));
        assert_eq!(sizes.get(2), None);
    }

    #[test]
    fn test_frames_led_by_tag_valued_sensor_ids() {
        // Sensor ids 0 and 1 share their values with the KeepAlive and Info tags.
        let params = vec![
            SensorParams::new(100, 2, "a"),
            SensorParams::new(200, 2, "b"),
        ];
        let sizes = ExpectedSizes::from_params(&params).unwrap();
        assert_eq!(sizes.get(0), Some(25));

        let first = batch(0, 2, 10);
        let second = batch(1, 2, 20);
        let mut buf = first.encode_frame();
        buf.extend_from_slice(&second.encode_frame());

        let (framed, consumed) = sizes.frame_samples(&buf).unwrap();
        assert_eq!(framed, vec![first, second]);
        assert_eq!(consumed, 50);
    }

    #[test]
    fn test_frame_samples_concatenated() {
        let sizes = ExpectedSizes::from_params(&params()).unwrap();
        let batches = vec![batch(0, 10, 0), batch(1, 5, 50), batch(0, 10, 1_000)];
        let mut buf = Vec::new();
        for b in &batches {
            buf.extend_from_slice(&b.encode_frame());
        }

        let (framed, consumed) = sizes.frame_samples(&buf).unwrap();
        assert_eq!(framed, batches);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_frame_samples_arbitrary_splits() {
        let sizes = ExpectedSizes::from_params(&params()).unwrap();
        let batches: Vec<SensorSamples> = (0..20)
            .map(|i| {
                if i % 3 == 0 {
                    batch(1, 5, i * 1_000)
                } else {
                    batch(0, 10, i * 1_000)
                }
            })
            .collect();

        let mut stream = Vec::new();
        let mut boundaries = vec![0];
        for b in &batches {
            stream.extend_from_slice(&b.encode_frame());
            boundaries.push(stream.len());
        }

        let mut rng = fastrand::Rng::with_seed(0x5eed);
        for _ in 0..50 {
            let mut pending: Vec<u8> = Vec::new();
            let mut framed = Vec::new();
            let mut fed = 0;
            while fed < stream.len() {
                let chunk = rng.usize(1..=64).min(stream.len() - fed);
                pending.extend_from_slice(&stream[fed..fed + chunk]);
                fed += chunk;

                let (complete, consumed) = sizes.frame_samples(&pending).unwrap();
                framed.extend(complete);
                pending.drain(..consumed);

                assert_eq!(pending.is_empty(), boundaries.contains(&fed));
            }
            assert_eq!(framed, batches);
            assert!(pending.is_empty());
        }
    }

    #[test]
    fn test_frame_samples_waits_for_complete_frame() {
        let sizes = ExpectedSizes::from_params(&params()).unwrap();
        assert_eq!(sizes.frame_samples(&[]).unwrap(), (Vec::new(), 0));

        let bytes = batch(1, 5, 0).encode_frame();
        let (framed, consumed) = sizes.frame_samples(&bytes[..bytes.len() - 1]).unwrap();
        assert!(framed.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_frame_samples_unknown_sensor() {
        let sizes = ExpectedSizes::from_params(&params()).unwrap();
        // Rejected from the leading byte alone.
        assert_eq!(
            sizes.frame_samples(&[7]),
            Err(ProtocolError::UnknownSensor(7))
        );
    }
}
