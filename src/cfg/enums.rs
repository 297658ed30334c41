// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Transport scheme parsed out of a destination address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Tcp,
    Tls,
    Pipe,
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnType::Tcp => "tcp",
            ConnType::Tls => "tls",
            ConnType::Pipe => "pipe",
        })
    }
}

/// Chan-cacher operating mode (§4.5).
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Small in-memory buffer, no disk, used while a connection is hot.
    #[default]
    #[serde(rename = "Passthrough", alias = "passthrough")]
    Passthrough,
    /// Always spill to disk, regardless of connection state. A full spool
    /// blocks the producer.
    #[serde(rename = "Always", alias = "always")]
    Always,
    /// Caching disabled entirely; a blocked output channel blocks input too.
    #[serde(rename = "Fail", alias = "fail")]
    Fail,
}
