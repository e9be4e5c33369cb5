// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Live session table.
//!
//! At most one session per device name is live. Claiming a name that is
//! already held preempts the older session: it is told to stop and to skip
//! marking the device disconnected, since the new session owns the device
//! from now on. The lock is only held for the map lookup/insert/remove.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Stop flags shared between a session and the table.
#[derive(Debug)]
pub struct SessionControl {
    running: AtomicBool,
    preempted: AtomicBool,
}

impl SessionControl {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            preempted: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// A newer session took over the device name.
    pub fn was_preempted(&self) -> bool {
        self.preempted.load(Ordering::Acquire)
    }

    fn preempt(&self) {
        self.preempted.store(true, Ordering::Release);
        self.stop();
    }
}

#[derive(Debug)]
struct Entry {
    id: u64,
    control: Arc<SessionControl>,
}

/// Device name to live session.
#[derive(Debug, Default)]
pub struct SessionTable {
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session under `name`, preempting the current holder.
    ///
    /// The returned ticket removes the entry when dropped, unless a newer
    /// session has replaced it by then.
    pub fn claim(self: &Arc<Self>, name: &str) -> SessionTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let control = Arc::new(SessionControl::new());

        let previous = self.entries.lock().insert(
            name.to_string(),
            Entry {
                id,
                control: control.clone(),
            },
        );

        let preempted = previous.is_some();
        if let Some(previous) = previous {
            warn!(device = %name, "Device already connected, stopping previous session");
            previous.control.preempt();
        }

        SessionTicket {
            table: self.clone(),
            name: name.to_string(),
            id,
            control,
            preempted_other: preempted,
        }
    }

    /// Remove `name` if it is still held by session `id`.
    fn release(&self, name: &str, id: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(name) {
            Some(entry) if entry.id == id => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Stop every live session. Returns how many were signalled.
    pub fn stop_all(&self) -> usize {
        let entries = self.entries.lock();
        for entry in entries.values() {
            entry.control.stop();
        }
        entries.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// A session's hold on its device name.
#[derive(Debug)]
pub struct SessionTicket {
    table: Arc<SessionTable>,
    name: String,
    id: u64,
    control: Arc<SessionControl>,
    preempted_other: bool,
}

impl SessionTicket {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control(&self) -> &SessionControl {
        &self.control
    }

    /// Whether claiming this ticket stopped an older session.
    pub fn preempted_other(&self) -> bool {
        self.preempted_other
    }

    /// Whether this session still owns the name.
    pub fn is_current(&self) -> bool {
        self.table
            .entries
            .lock()
            .get(&self.name)
            .is_some_and(|e| e.id == self.id)
    }

    /// Whether another live session holds the name.
    pub fn name_held_by_other(&self) -> bool {
        self.table
            .entries
            .lock()
            .get(&self.name)
            .is_some_and(|e| e.id != self.id)
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        self.table.release(&self.name, self.id);
    }
}
