// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The confirmation window: a fixed-capacity ring of in-flight entries keyed
//! by send-ID, used by the entry writer to throttle itself to what the peer
//! has acknowledged and by the writer-relay to find what needs replaying
//! after a connection dies.
//!
//! Entries slide off the front of the ring only once the oldest slot has
//! been acked, so acks may arrive out of order but the window's occupied
//! length still reflects the oldest unacked send.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::entry::model::Entry;

struct Slot {
    id: u64,
    entry: Entry,
    acked: bool,
}

/// Default window capacity when a destination doesn't override it.
pub const DEFAULT_CAPACITY: usize = 128;

pub struct ConfirmationWindow {
    capacity: usize,
    slots: Mutex<VecDeque<Slot>>,
    notify: Notify,
}

impl ConfirmationWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Slot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Non-blocking insert; returns the entry back to the caller if the
    /// window is full.
    pub fn try_add(&self, id: u64, entry: Entry) -> Result<(), Entry> {
        let mut g = self.lock();
        if g.len() >= self.capacity {
            return Err(entry);
        }
        g.push_back(Slot { id, entry, acked: false });
        Ok(())
    }

    /// Blocks until there is room, then inserts. This is the back-pressure
    /// mechanism the entry writer relies on: a destination that stops
    /// acking eventually stalls every writer waiting on `add`.
    pub async fn add(&self, id: u64, mut entry: Entry) {
        loop {
            match self.try_add(id, entry) {
                Ok(()) => return,
                Err(e) => entry = e,
            }
            self.notify.notified().await;
        }
    }

    /// Marks `id` acked and slides the window forward past any now-acked
    /// prefix. Unknown ids are ignored (an ack for an already-slid-past or
    /// never-sent id is not an error, it's just stale).
    pub fn confirm(&self, id: u64) {
        let mut g = self.lock();
        if let Some(slot) = g.iter_mut().find(|s| s.id == id) {
            slot.acked = true;
        }
        while g.front().map(|s| s.acked).unwrap_or(false) {
            g.pop_front();
        }
        drop(g);
        self.notify.notify_waiters();
    }

    /// The unacked entries still held by the window, oldest first. Called
    /// when a connection dies so the muxer can hand them to the emergency
    /// queue or another destination.
    pub fn outstanding(&self) -> Vec<(u64, Entry)> {
        self.lock()
            .iter()
            .filter(|s| !s.acked)
            .map(|s| (s.id, s.entry.clone()))
            .collect()
    }

    /// Drains the window entirely, acked or not, and releases anyone
    /// blocked in `add`. Used on shutdown.
    pub fn drain_all(&self) -> Vec<(u64, Entry)> {
        let mut g = self.lock();
        let out = g.drain(..).map(|s| (s.id, s.entry)).collect();
        drop(g);
        self.notify.notify_waiters();
        out
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}
