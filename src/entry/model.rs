// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Entry/Batch data model.

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::wire::entry_header::MAX_DATA_LEN;

/// Practical cap on a single entry's payload; the wire format's theoretical
/// ceiling (`MAX_DATA_LEN`, ~1 GiB) is far larger than any sane single
/// record, so callers are expected to configure something smaller (spec
/// §3's "practical cap lower").
pub const MAX_ENTRY_SIZE: u64 = MAX_DATA_LEN as u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceAddr {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl SourceAddr {
    pub fn unset_v4() -> Self {
        SourceAddr::V4([0, 0, 0, 0])
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, SourceAddr::V4([0, 0, 0, 0]))
    }
}

/// One name/value pair of an entry's optional enumerated values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumeratedValue {
    pub name: String,
    pub value: Vec<u8>,
}

/// The unit of ingestion: timestamp + source + tag + payload, plus
/// optional enumerated values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub timestamp_sec: u64,
    pub timestamp_nsec: u32,
    pub tag: u16,
    pub source: SourceAddr,
    pub payload: Vec<u8>,
    pub enum_values: Option<Vec<EnumeratedValue>>,
}

impl Entry {
    pub fn new(
        timestamp_sec: u64,
        timestamp_nsec: u32,
        tag: u16,
        source: SourceAddr,
        payload: Vec<u8>,
    ) -> Self {
        Self { timestamp_sec, timestamp_nsec, tag, source, payload, enum_values: None }
    }

    pub fn with_enum_values(mut self, values: Vec<EnumeratedValue>) -> Self {
        self.enum_values = Some(values);
        self
    }

    /// Rejects entries whose payload exceeds [`MAX_ENTRY_SIZE`] (boundary
    /// behaviour: size 0 accepted, size `MAX_ENTRY_SIZE + 1` rejected).
    pub fn validate_size(&self) -> Result<()> {
        ensure!(
            (self.payload.len() as u64) <= MAX_ENTRY_SIZE,
            "entry payload of {} bytes exceeds MAX_ENTRY_SIZE ({MAX_ENTRY_SIZE})",
            self.payload.len()
        );
        Ok(())
    }

    /// Rewrites the local tag id to the peer's remote id (mutation allowed
    /// while in flight).
    pub fn set_tag(&mut self, tag: u16) {
        self.tag = tag;
    }

    /// Fills in the source address if it was left unset by the producer.
    pub fn set_source_if_unset(&mut self, source: SourceAddr) {
        if self.source.is_unset() {
            self.source = source;
        }
    }
}

/// An ordered slice of entries submitted together. Atomic only
/// with respect to the channel transport, not the wire.
pub type Batch = Vec<Entry>;
