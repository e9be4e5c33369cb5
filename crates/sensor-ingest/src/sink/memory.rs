// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory sink recording every batch.

use super::{Point, Sink, SinkError};
use parking_lot::Mutex;

/// One `write_batch` call as seen by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenBatch {
    pub run_name: String,
    pub points: Vec<Point>,
}

#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<WrittenBatch>>,
    fail_writes: Mutex<Option<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<WrittenBatch> {
        self.batches.lock().clone()
    }

    /// All points written so far, in write order.
    pub fn points(&self) -> Vec<Point> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.points.iter().cloned())
            .collect()
    }

    pub fn point_count(&self) -> usize {
        self.batches.lock().iter().map(|b| b.points.len()).sum()
    }

    /// Make subsequent writes fail with `reason` (`None` restores success).
    pub fn fail_writes(&self, reason: Option<&str>) {
        *self.fail_writes.lock() = reason.map(str::to_string);
    }
}

impl Sink for MemorySink {
    fn write_batch(&self, run_name: &str, points: Vec<Point>) -> Result<(), SinkError> {
        if let Some(reason) = self.fail_writes.lock().as_ref() {
            return Err(SinkError::Http(reason.clone()));
        }
        self.batches.lock().push(WrittenBatch {
            run_name: run_name.to_string(),
            points,
        });
        Ok(())
    }
}
