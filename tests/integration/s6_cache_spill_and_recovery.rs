// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cache spill and recovery: entries written while no
//! destination is reachable land in the in-memory emergency queue; closing
//! the muxer drains that queue into the batch cache and commits both spools
//! to disk; a second muxer opened against the same cache directory, once a
//! destination actually comes up, must recover and deliver every one of
//! them.

use std::time::Duration;

use ingest_mux::cfg::config::{CacheConfig, DestinationConfig, IngesterIdentity, MuxerConfig};
use ingest_mux::cfg::enums::CacheMode;
use ingest_mux::entry::{Entry, SourceAddr};
use ingest_mux::muxer::IngestMuxer;

use crate::integration_tests::common::{MockIndexerOpts, bind_loopback, spawn_mock_indexer_gated};

fn entry(tag: u16, n: u32) -> Entry {
    Entry::new(0, 0, tag, SourceAddr::unset_v4(), n.to_le_bytes().to_vec())
}

fn cfg(cache_dir: &std::path::Path, addr: std::net::SocketAddr) -> MuxerConfig {
    MuxerConfig {
        destinations: vec![DestinationConfig {
            address: format!("tcp://{addr}"),
            secret: None,
            tenant: None,
            tls: None,
        }],
        cache: CacheConfig {
            mode: CacheMode::Always,
            path: Some(cache_dir.to_string_lossy().into_owned()),
            max_size_mb: 16,
        },
        rate_limit: None,
        ingester: IngesterIdentity {
            name: "s6-test".into(),
            version: "0".into(),
            uuid: None,
            label: "".into(),
        },
        max_unconfirmed: 64,
        ack_flush_interval_ms: 10,
        // Short: while the gate is closed, every connect attempt hangs
        // through the handshake's single timeout and nothing else, so this
        // bounds how long `close()` waits for the supervisor to notice
        // cancellation and give up.
        connection_timeout_secs: 2,
        emergency_queue_capacity: 32,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn entries_written_while_unreachable_survive_a_close_and_reopen() {
    let cache_dir = tempfile::tempdir().expect("creating a persistent cache dir for both muxer instances");

    let listener = bind_loopback().await.expect("binding the destination's listener up front");
    let addr = listener.local_addr().expect("listener has a local addr");
    let (open_gate, gate_rx) = tokio::sync::oneshot::channel();
    let indexer = spawn_mock_indexer_gated(listener, MockIndexerOpts::default(), gate_rx);

    let muxer1 = IngestMuxer::new(cfg(cache_dir.path(), addr)).await.expect("building first muxer");
    muxer1.start().await.expect("starting first muxer");

    let tag = muxer1.get_tag("default").expect("default tag is always registered");

    // Stays within `emergency_queue_capacity` so every write lands safely in
    // the emergency queue instead of being dropped for overflow: the
    // destination never accepts while the gate is held, so the dispatcher
    // can never route these anywhere else.
    for i in 0..20u32 {
        muxer1.write(entry(tag, i)).await.expect("enqueuing entry while unreachable");
    }

    // Every one of the 20 writes above already hit `cache_dir` as it was
    // pushed into the emergency-backed entry spool. `close()` cancels the
    // supervisor (whose lone connect attempt is stuck mid-handshake and
    // bounded by `connection_timeout_secs`), drains the emergency queue into
    // the batch cache, and commits both spools plus the tag cache to
    // `cache_dir` — a compaction of what's already durable, not the first
    // write.
    muxer1.close().await.expect("closing first muxer should drain and persist");

    // Now let the destination actually start accepting, and open a second
    // muxer against the very same cache directory.
    let _ = open_gate.send(());

    let muxer2 = IngestMuxer::new(cfg(cache_dir.path(), addr)).await.expect("building second muxer");
    muxer2.start().await.expect("starting second muxer");
    muxer2.wait_for_hot(Duration::from_secs(5)).await.expect("destination should come up hot this time");

    muxer2.sync(Duration::from_secs(10)).await.expect("sync should drain the recovered batch cache");

    let received = indexer.received_payloads().await;
    assert_eq!(received.len(), 20, "every entry written before the close should have survived the round trip");
    let mut seen: Vec<u32> = received
        .iter()
        .map(|p| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&p[..4]);
            u32::from_le_bytes(buf)
        })
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..20u32).collect::<Vec<_>>(), "no entry should be duplicated or missing");

    muxer2.close().await.expect("closing second muxer");
    indexer.shutdown();
}
