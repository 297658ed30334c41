// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The emergency queue: a bounded fallback list where entries pulled out of
//! a dying connection wait between that connection's death and another
//! connection's readiness.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::entry::model::Entry;

pub const DEFAULT_CAPACITY: usize = 128;

pub struct EmergencyQueue {
    capacity: usize,
    items: Mutex<VecDeque<Entry>>,
}

impl EmergencyQueue {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), items: Mutex::new(VecDeque::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Entry>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns the entry back to the caller on overflow rather than
    /// blocking; the recycle path logs and drops it instead of stalling.
    pub fn push(&self, entry: Entry) -> Result<(), Entry> {
        let mut g = self.lock();
        if g.len() >= self.capacity {
            return Err(entry);
        }
        g.push_back(entry);
        Ok(())
    }

    pub fn pop(&self) -> Option<Entry> {
        self.lock().pop_front()
    }

    /// Drains everything, used when handing the whole backlog to the cacher
    /// on shutdown.
    pub fn drain(&self) -> Vec<Entry> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
