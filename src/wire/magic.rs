// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Little-endian `u32` magic numbers that open every record on the wire
//! Each connects a raw byte stream to one of a handful of
//! record shapes; `RecordMagic::try_from` is the single place that maps a
//! magic back to a variant.

use anyhow::{Result, bail};

pub const NEW_ENTRY_MAGIC: u32 = 0x3411_0903;
pub const FORCE_ACK_MAGIC: u32 = 0x2812_1202;
pub const CONFIRM_ENTRY_MAGIC: u32 = 0x2211_1009;
pub const TAG_REQUEST_MAGIC: u32 = 0x1901_0203;
pub const TAG_RESPONSE_MAGIC: u32 = 0x1901_0204;
pub const CHALLENGE_MAGIC: u32 = 0x0501_0102;
pub const CHALLENGE_RESPONSE_MAGIC: u32 = 0x0501_0103;
pub const STATE_RESPONSE_MAGIC: u32 = 0x0501_0104;
pub const INGESTER_ID_MAGIC: u32 = 0x0601_0105;
pub const STREAM_CONFIG_MAGIC: u32 = 0x0601_0106;
pub const INGESTER_STATE_MAGIC: u32 = 0x0601_0107;
pub const DITTO_MAGIC: u32 = 0x0701_0108;
pub const DITTO_ACK_MAGIC: u32 = 0x0701_0109;

/// State ids carried in a [`crate::wire::auth::StateResponse`].
pub const STATE_AUTHENTICATED: u32 = 0x00BE_EF42;
pub const STATE_NOT_AUTHENTICATED: u32 = 0x00FE_ED51;
pub const STATE_HOT: u32 = 0x00CA_FE54;

/// Maximum sizes for length-prefixed JSON envelopes.
pub const MAX_STATE_RESPONSE_SIZE: usize = 4 * 1024;
pub const MAX_TAG_REQUEST_SIZE: usize = 32 * 1024 * 1024;
pub const MAX_TAG_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// A decoded record kind, keyed off its leading magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMagic {
    NewEntry,
    ForceAck,
    ConfirmEntry,
    TagRequest,
    TagResponse,
    Challenge,
    ChallengeResponse,
    StateResponse,
    IngesterId,
    StreamConfig,
    IngesterState,
    Ditto,
    DittoAck,
}

impl TryFrom<u32> for RecordMagic {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            NEW_ENTRY_MAGIC => RecordMagic::NewEntry,
            FORCE_ACK_MAGIC => RecordMagic::ForceAck,
            CONFIRM_ENTRY_MAGIC => RecordMagic::ConfirmEntry,
            TAG_REQUEST_MAGIC => RecordMagic::TagRequest,
            TAG_RESPONSE_MAGIC => RecordMagic::TagResponse,
            CHALLENGE_MAGIC => RecordMagic::Challenge,
            CHALLENGE_RESPONSE_MAGIC => RecordMagic::ChallengeResponse,
            STATE_RESPONSE_MAGIC => RecordMagic::StateResponse,
            INGESTER_ID_MAGIC => RecordMagic::IngesterId,
            STREAM_CONFIG_MAGIC => RecordMagic::StreamConfig,
            INGESTER_STATE_MAGIC => RecordMagic::IngesterState,
            DITTO_MAGIC => RecordMagic::Ditto,
            DITTO_ACK_MAGIC => RecordMagic::DittoAck,
            other => bail!("unexpected magic 0x{other:08x}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_magics() {
        for m in [
            NEW_ENTRY_MAGIC,
            FORCE_ACK_MAGIC,
            CONFIRM_ENTRY_MAGIC,
            TAG_REQUEST_MAGIC,
            TAG_RESPONSE_MAGIC,
        ] {
            assert!(RecordMagic::try_from(m).is_ok());
        }
        assert!(RecordMagic::try_from(0xdead_beef).is_err());
    }
}
