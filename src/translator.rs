// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection tag translation: an ordered `active` table
//! mapping the muxer's local tag id to this peer's remote tag id, plus a
//! queue of locally-known tags this connection hasn't negotiated yet.

use std::collections::VecDeque;
use std::sync::RwLock;

use anyhow::{Result, ensure};

use crate::wire::entry_header::GRAVWELL_TAG_ID;

pub struct TagTranslator {
    active: RwLock<Vec<u16>>,
    to_negotiate: RwLock<VecDeque<(u16, String)>>,
}

impl Default for TagTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl TagTranslator {
    pub fn new() -> Self {
        Self { active: RwLock::new(Vec::new()), to_negotiate: RwLock::new(VecDeque::new()) }
    }

    fn active(&self) -> std::sync::RwLockReadGuard<'_, Vec<u16>> {
        self.active.read().unwrap_or_else(|p| p.into_inner())
    }

    /// O(1) array lookup. `None` means "need to negotiate first".
    pub fn translate(&self, local: u16) -> Option<u16> {
        if local == GRAVWELL_TAG_ID {
            return Some(GRAVWELL_TAG_ID);
        }
        self.active().get(local as usize).copied()
    }

    /// Linear scan; only used on the slow path (connection death →
    /// requeue), where the unconfirmed entry count is small.
    pub fn reverse(&self, remote: u16) -> Option<u16> {
        if remote == GRAVWELL_TAG_ID {
            return Some(GRAVWELL_TAG_ID);
        }
        self.active().iter().position(|&r| r == remote).map(|i| i as u16)
    }

    /// Appends to `active`; requires `local == len(active)` (strict
    /// monotonicity, since this table mirrors the muxer's dense local ids).
    pub fn register_tag(&self, local: u16, remote: u16) -> Result<()> {
        let mut g = self.active.write().unwrap_or_else(|p| p.into_inner());
        ensure!(
            local as usize == g.len(),
            "tag translator requires strict monotonicity: got local={local}, expected={}",
            g.len()
        );
        g.push(remote);
        Ok(())
    }

    pub fn register_for_negotiation(&self, local: u16, name: String) {
        let mut g = self.to_negotiate.write().unwrap_or_else(|p| p.into_inner());
        if g.iter().any(|(l, _)| *l == local) {
            return;
        }
        g.push_back((local, name));
    }

    pub fn has_pending(&self) -> bool {
        !self.to_negotiate.read().unwrap_or_else(|p| p.into_inner()).is_empty()
    }

    /// Empties the pending-negotiation queue, handing the caller everything
    /// that needs to go out in the next TagRequest.
    pub fn drain_pending(&self) -> Vec<(u16, String)> {
        self.to_negotiate.write().unwrap_or_else(|p| p.into_inner()).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
