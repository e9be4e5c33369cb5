// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device socket with a receive accumulator.
//!
//! Reads append to an accumulator; framers look at [`DeviceConnection::pending`]
//! and report how many bytes they used through [`DeviceConnection::consume`].
//! Consumed bytes are reclaimed lazily, once they make up more than half of
//! the accumulator.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Result of one [`DeviceConnection::fill`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` new bytes were appended.
    Data(usize),
    /// The read timeout expired without data.
    TimedOut,
    /// The peer closed the connection.
    Closed,
}

/// Connection error types.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("receive buffer overflow: {buffered} bytes pending (max {max})")]
    BufferOverflow { buffered: usize, max: usize },
}

/// A connected device socket.
pub struct DeviceConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    accumulator: Vec<u8>,
    accumulator_pos: usize,
    recv_size: usize,
    max_buffered: usize,
    last_rx: Instant,
    bytes_received: u64,
}

impl DeviceConnection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, recv_size: usize, max_buffered: usize) -> Self {
        Self {
            stream,
            peer_addr,
            accumulator: Vec::with_capacity(recv_size * 2),
            accumulator_pos: 0,
            recv_size,
            max_buffered,
            last_rx: Instant::now(),
            bytes_received: 0,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))
    }

    /// Read once from the socket into the accumulator.
    pub fn fill(&mut self) -> Result<ReadOutcome, ConnectionError> {
        self.compact();

        let start = self.accumulator.len();
        self.accumulator.resize(start + self.recv_size, 0);
        let result = self.stream.read(&mut self.accumulator[start..]);

        let n = match result {
            Ok(n) => n,
            Err(e) => {
                self.accumulator.truncate(start);
                return match e.kind() {
                    io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted => Ok(ReadOutcome::TimedOut),
                    _ => Err(e.into()),
                };
            }
        };
        self.accumulator.truncate(start + n);
        if n == 0 {
            return Ok(ReadOutcome::Closed);
        }

        self.last_rx = Instant::now();
        self.bytes_received += n as u64;

        let buffered = self.pending().len();
        if buffered > self.max_buffered {
            return Err(ConnectionError::BufferOverflow {
                buffered,
                max: self.max_buffered,
            });
        }
        Ok(ReadOutcome::Data(n))
    }

    /// Bytes received but not consumed yet.
    pub fn pending(&self) -> &[u8] {
        &self.accumulator[self.accumulator_pos..]
    }

    /// Mark the first `n` pending bytes as used.
    pub fn consume(&mut self, n: usize) {
        self.accumulator_pos = (self.accumulator_pos + n).min(self.accumulator.len());
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Time since the last byte arrived.
    pub fn idle_for(&self) -> Duration {
        self.last_rx.elapsed()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    fn compact(&mut self) {
        if self.accumulator_pos == 0 {
            return;
        }
        if self.accumulator_pos == self.accumulator.len() {
            self.accumulator.clear();
            self.accumulator_pos = 0;
        } else if self.accumulator_pos > self.accumulator.len() / 2 {
            self.accumulator.drain(..self.accumulator_pos);
            self.accumulator_pos = 0;
        }
    }
}
