// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Public, typed errors returned to callers of the muxer. Internal plumbing
//! uses `anyhow` throughout (see `Cargo.toml`/teacher convention); this enum
//! is the boundary where a caller needs to match on *kind*, not just log a
//! message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("muxer is not running")]
    NotRunning,

    #[error("operation timed out")]
    Timeout,

    #[error("all destination connections are down")]
    AllConnsDown,

    #[error("entry payload of {size} bytes exceeds the maximum of {max}")]
    OversizeEntry { size: u64, max: u64 },

    #[error("unknown tag id {0}")]
    UnknownTag(u16),

    #[error("muxer has already been started")]
    AlreadyStarted,

    #[error("muxer has already been closed")]
    AlreadyClosed,

    #[error("authentication refused by {destination}: {reason}")]
    AuthRefused { destination: String, reason: String },

    #[error("tag negotiation refused by {destination}")]
    TagNegotiationRefused { destination: String },

    #[error("malformed destination address {0:?}")]
    MalformedDestination(String),

    #[error("local tag namespace is exhausted")]
    TooManyTags,

    #[error("{0} of {1} destinations failed: {2}")]
    PartialFailure(usize, usize, String),
}
