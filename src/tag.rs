// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The muxer-wide tag namespace: a dense name↔local-id table, persisted to
//! the `tagcache` file alongside the disk spool so local ids survive a
//! restart.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Result, ensure};

use crate::wire::entry_header::GRAVWELL_TAG_ID;
use crate::wire::tag_codec::validate_tag_name;

/// Local tag id 0 is the default tag, pre-registered so every muxer starts
/// with at least one usable tag.
pub const DEFAULT_TAG_NAME: &str = "default";
pub const DEFAULT_TAG_ID: u16 = 0;

/// One below the reserved "gravwell" id; the muxer refuses to allocate past
/// this point (the `MaxTagId` check).
pub const MAX_TAG_ID: usize = GRAVWELL_TAG_ID as usize;

struct Inner {
    by_name: HashMap<String, u16>,
    by_id: Vec<String>,
}

/// Thread-safe, append-only (ids are never reused) tag table shared by the
/// muxer and read by every supervisor/writer-relay.
pub struct TagMap {
    inner: RwLock<Inner>,
}

impl Default for TagMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TagMap {
    pub fn new() -> Self {
        let mut by_name = HashMap::new();
        by_name.insert(DEFAULT_TAG_NAME.to_string(), DEFAULT_TAG_ID);
        Self {
            inner: RwLock::new(Inner { by_name, by_id: vec![DEFAULT_TAG_NAME.to_string()] }),
        }
    }

    /// Rebuilds a `TagMap` from a persisted `name -> id` snapshot (the
    /// `tagcache` file), restoring ids in their original order.
    pub fn from_snapshot(snapshot: HashMap<String, u16>) -> Result<Self> {
        let mut by_id_slots: Vec<Option<String>> = vec![None; snapshot.len()];
        for (name, id) in &snapshot {
            let idx = *id as usize;
            ensure!(idx < by_id_slots.len(), "tagcache entry {name:?} has out-of-range id {id}");
            ensure!(by_id_slots[idx].is_none(), "tagcache has duplicate id {id}");
            by_id_slots[idx] = Some(name.clone());
        }
        let mut by_id = Vec::with_capacity(by_id_slots.len());
        for (idx, slot) in by_id_slots.into_iter().enumerate() {
            by_id.push(slot.ok_or_else(|| anyhow::anyhow!("tagcache missing id {idx}"))?);
        }
        Ok(Self { inner: RwLock::new(Inner { by_name: snapshot, by_id }) })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// O(1) lookup; the reserved "gravwell" id always resolves even though
    /// it has no entry in the table.
    pub fn get(&self, name: &str) -> Option<u16> {
        if name == "gravwell" {
            return Some(GRAVWELL_TAG_ID);
        }
        self.read().by_name.get(name).copied()
    }

    pub fn name_of(&self, id: u16) -> Option<String> {
        if id == GRAVWELL_TAG_ID {
            return Some("gravwell".to_string());
        }
        self.read().by_id.get(id as usize).cloned()
    }

    pub fn is_known(&self, id: u16) -> bool {
        id == GRAVWELL_TAG_ID || (id as usize) < self.read().by_id.len()
    }

    /// Allocates the next dense local id for `name`, or returns the
    /// existing one if it was already registered (NegotiateTag must be
    /// idempotent per name).
    pub fn get_or_register(&self, name: &str) -> Result<u16> {
        validate_tag_name(name)?;
        if let Some(id) = self.get(name) {
            return Ok(id);
        }
        let mut g = self.write();
        if let Some(&id) = g.by_name.get(name) {
            return Ok(id);
        }
        ensure!(g.by_id.len() < MAX_TAG_ID, "tag namespace exhausted ({MAX_TAG_ID} tags)");
        let id = g.by_id.len() as u16;
        g.by_id.push(name.to_string());
        g.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A `name -> id` copy suitable for bincode-encoding into the
    /// `tagcache` file.
    pub fn snapshot(&self) -> HashMap<String, u16> {
        self.read().by_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tag_is_preregistered() {
        let m = TagMap::new();
        assert_eq!(m.get(DEFAULT_TAG_NAME), Some(DEFAULT_TAG_ID));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn negotiate_twice_yields_same_id() {
        let m = TagMap::new();
        let a = m.get_or_register("syslog").unwrap();
        let b = m.get_or_register("syslog").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn gravwell_id_is_reserved_and_bypasses_table() {
        let m = TagMap::new();
        assert_eq!(m.get("gravwell"), Some(GRAVWELL_TAG_ID));
        assert!(m.is_known(GRAVWELL_TAG_ID));
        assert_eq!(m.name_of(GRAVWELL_TAG_ID).as_deref(), Some("gravwell"));
    }

    #[test]
    fn snapshot_round_trips_through_from_snapshot() {
        let m = TagMap::new();
        m.get_or_register("auth").unwrap();
        m.get_or_register("syslog").unwrap();
        let snap = m.snapshot();
        let restored = TagMap::from_snapshot(snap).unwrap();
        assert_eq!(restored.get("auth"), m.get("auth"));
        assert_eq!(restored.get("syslog"), m.get("syslog"));
        assert_eq!(restored.len(), m.len());
    }

    #[test]
    fn rejects_forbidden_tag_name() {
        let m = TagMap::new();
        assert!(m.get_or_register("bad tag").is_err());
    }
}
