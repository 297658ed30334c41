// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::UdpSocket;

use crate::entry::model::SourceAddr;

/// Best-effort local source address, used to fill in an entry's source IP
/// when a producer left it unset (the writer-relay's "set source IP
/// if empty"). We never actually send on this socket; connecting a UDP
/// socket is just the usual trick to ask the OS which local address it
/// would route through, without touching the network.
///
/// Falls back to the unset address on any failure ("local
/// IP parse failure" as fatal only for the connection attempt that needs
/// it; the writer-relay path degrades gracefully instead).
pub fn detect_local_source_addr() -> SourceAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|sock| {
            sock.connect("8.8.8.8:80")?;
            sock.local_addr()
        })
        .map(|addr| match addr.ip() {
            std::net::IpAddr::V4(v4) => SourceAddr::V4(v4.octets()),
            std::net::IpAddr::V6(v6) => SourceAddr::V6(v6.octets()),
        })
        .unwrap_or_else(|_| SourceAddr::unset_v4())
}
