//! The binary wire protocol one indexer connection speaks: framing,
//! authentication, and tag-name negotiation.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Challenge/response authentication handshake.
pub mod auth;
/// Ingester identification, stream config, state pushes, and ditto blocks.
pub mod control;
/// Entry record header encode/decode.
pub mod entry_header;
/// Frame read/write helpers shared by connection and writer/reader.
pub mod framer;
/// Record magic numbers.
pub mod magic;
/// Tag request/response JSON envelopes.
pub mod tag_codec;
