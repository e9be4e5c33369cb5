// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfluxDB v2 HTTP writer.
//!
//! Each measurement run owns a bucket named after it; batches are posted to
//! `/api/v2/write` as Line Protocol with nanosecond timestamps.

use super::line_protocol::LineProtocolWriter;
use super::{Point, Sink, SinkError};
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::{debug, trace};

pub struct InfluxSink {
    client: Client,
    write_url: String,
    org: String,
    token: String,
}

impl InfluxSink {
    pub fn new(
        url: &str,
        org: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Http(e.to_string()))?;

        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", url.trim_end_matches('/')),
            org: org.into(),
            token: token.into(),
        })
    }

    pub fn write_url(&self) -> &str {
        &self.write_url
    }
}

impl Sink for InfluxSink {
    fn write_batch(&self, run_name: &str, points: Vec<Point>) -> Result<(), SinkError> {
        let mut writer = LineProtocolWriter::new();
        writer.write_points(&points);
        if writer.skipped() > 0 {
            debug!(bucket = %run_name, skipped = writer.skipped(), "Non-finite values not written");
        }
        if writer.is_empty() {
            return Ok(());
        }
        let lines = writer.len();

        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", run_name),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(writer.flush_body())
            .send()
            .map_err(|e| SinkError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Rejected {
                bucket: run_name.to_string(),
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }

        trace!(bucket = %run_name, lines, "Batch written");
        Ok(())
    }
}
