// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Entries, batches, the confirmation window, and the entry writer/ack
//! reader pair.

pub mod confirm;
pub mod model;
pub mod writer;

pub use model::{Batch, Entry, EnumeratedValue, SourceAddr};
