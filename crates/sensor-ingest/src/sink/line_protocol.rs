// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfluxDB v2 Line Protocol rendering.
//!
//! Line Protocol format:
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1 timestamp_ns
//! ```
//!
//! Measurement is the run id, the only tag is `sensor_node` and the single
//! field is named after the sensor.
//!
//! See: <https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/>

use super::{Point, Sink, SinkError};
use parking_lot::Mutex;
use std::io::Write;

/// Accumulates points as Line Protocol strings.
///
/// Non-finite values have no Line Protocol representation and are skipped.
pub struct LineProtocolWriter {
    buffer: Vec<String>,
    skipped: usize,
}

impl LineProtocolWriter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            skipped: 0,
        }
    }

    pub fn write_point(&mut self, point: &Point) {
        if !point.value.is_finite() {
            self.skipped += 1;
            return;
        }

        let mut line = escape_measurement(&point.run_id.to_string());
        line.push_str(",sensor_node=");
        line.push_str(&escape_key(&point.device));
        line.push(' ');
        line.push_str(&escape_key(&point.sensor));
        line.push('=');
        line.push_str(&format_float(point.value));
        line.push(' ');
        line.push_str(&point.timestamp_ns().to_string());

        self.buffer.push(line);
    }

    pub fn write_points<'a>(&mut self, points: impl IntoIterator<Item = &'a Point>) {
        for point in points {
            self.write_point(point);
        }
    }

    /// Flush the buffer, returning all accumulated lines.
    pub fn flush(&mut self) -> Vec<String> {
        self.skipped = 0;
        std::mem::take(&mut self.buffer)
    }

    /// Flush the buffer as one newline-separated request body.
    pub fn flush_body(&mut self) -> String {
        self.flush().join("\n")
    }

    /// Points dropped since the last flush because their value was not finite.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for LineProtocolWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Escape measurement name per Line Protocol spec.
/// Spaces and commas must be escaped with backslash.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Escape a tag value or field key.
/// Commas, equals signs, and spaces must be escaped.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

// `{}` drops the fractional part of whole floats, which would turn the field
// into an integer on first write.
fn format_float(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

/// Sink writing one Line Protocol line per point to a `Write` target.
///
/// Each batch is preceded by a `# bucket=<run name>` comment line.
pub struct WriterSink<W: Write + Send> {
    out: Mutex<W>,
}

impl WriterSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> Sink for WriterSink<W> {
    fn write_batch(&self, run_name: &str, points: Vec<Point>) -> Result<(), SinkError> {
        let mut writer = LineProtocolWriter::new();
        writer.write_points(&points);
        if writer.is_empty() {
            return Ok(());
        }

        let mut out = self.out.lock();
        writeln!(out, "# bucket={}", run_name)?;
        for line in writer.flush() {
            writeln!(out, "{}", line)?;
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Precision;

    fn point(value: f64) -> Point {
        Point {
            run_id: 2,
            device: "node1".into(),
            sensor: "temp".into(),
            timestamp: 1_000,
            precision: Precision::Milliseconds,
            value,
        }
    }

    #[test]
    fn test_line_protocol_point() {
        let mut writer = LineProtocolWriter::new();
        writer.write_point(&point(23.5));

        let lines = writer.flush();
        assert_eq!(lines, vec!["2,sensor_node=node1 temp=23.5 1000000000"]);
    }

    #[test]
    fn test_line_protocol_whole_float_keeps_decimal() {
        let mut writer = LineProtocolWriter::new();
        writer.write_point(&point(21.0));
        assert_eq!(writer.flush()[0], "2,sensor_node=node1 temp=21.0 1000000000");
    }

    #[test]
    fn test_line_protocol_escaping() {
        let mut p = point(1.5);
        p.device = "lab node,1".into();
        p.sensor = "t=1".into();

        let mut writer = LineProtocolWriter::new();
        writer.write_point(&p);
        assert_eq!(
            writer.flush()[0],
            "2,sensor_node=lab\\ node\\,1 t\\=1=1.5 1000000000"
        );
    }

    #[test]
    fn test_line_protocol_microseconds() {
        let mut p = point(0.25);
        p.timestamp = 1_700_000_000_000_001;
        p.precision = Precision::Microseconds;

        let mut writer = LineProtocolWriter::new();
        writer.write_point(&p);
        assert!(writer.flush()[0].ends_with(" 1700000000000001000"));
    }

    #[test]
    fn test_non_finite_values_skipped() {
        let mut writer = LineProtocolWriter::new();
        writer.write_points(&[point(f64::NAN), point(1.0), point(f64::INFINITY)]);
        assert_eq!(writer.len(), 1);
        assert_eq!(writer.skipped(), 2);
        assert_eq!(writer.flush_body(), "2,sensor_node=node1 temp=1.0 1000000000");
    }

    #[test]
    fn test_writer_sink_output() {
        let sink = WriterSink::new(Vec::new());
        sink.write_batch("project-a", vec![point(1.5), point(2.5)])
            .unwrap();
        sink.write_batch("project-a", Vec::new()).unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            out,
            "# bucket=project-a\n\
             2,sensor_node=node1 temp=1.5 1000000000\n\
             2,sensor_node=node1 temp=2.5 1000000000\n"
        );
    }
}
