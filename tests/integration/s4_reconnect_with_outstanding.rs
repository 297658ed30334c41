// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reconnect with outstanding: one destination dies mid-write
//! with unacked entries in flight; those entries must come back with their
//! tag reversed to local and land on the surviving destination instead of
//! being lost.

use std::time::Duration;

use ingest_mux::cfg::config::{CacheConfig, DestinationConfig, IngesterIdentity, MuxerConfig};
use ingest_mux::cfg::enums::CacheMode;
use ingest_mux::entry::{Entry, SourceAddr};
use ingest_mux::muxer::IngestMuxer;

use crate::integration_tests::common::{DeathAfter, MockIndexerOpts, spawn_mock_indexer};

fn entry(tag: u16, n: u32) -> Entry {
    Entry::new(0, 0, tag, SourceAddr::unset_v4(), n.to_le_bytes().to_vec())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outstanding_entries_recycle_onto_the_surviving_destination() {
    let dying = spawn_mock_indexer(MockIndexerOpts {
        secret: None,
        die_after: DeathAfter::Entries(20),
    })
    .await
    .expect("spawning the mock indexer that will die");
    let survivor =
        spawn_mock_indexer(MockIndexerOpts::default()).await.expect("spawning the survivor mock indexer");

    let cfg = MuxerConfig {
        destinations: vec![
            DestinationConfig {
                address: format!("tcp://{}", dying.addr),
                secret: None,
                tenant: None,
                tls: None,
            },
            DestinationConfig {
                address: format!("tcp://{}", survivor.addr),
                secret: None,
                tenant: None,
                tls: None,
            },
        ],
        cache: CacheConfig { mode: CacheMode::Always, path: None, max_size_mb: 16 },
        rate_limit: None,
        ingester: IngesterIdentity {
            name: "s4-test".into(),
            version: "0".into(),
            uuid: None,
            label: "".into(),
        },
        max_unconfirmed: 256,
        ack_flush_interval_ms: 10,
        connection_timeout_secs: 2,
        emergency_queue_capacity: 256,
    };

    let muxer = IngestMuxer::new(cfg).await.expect("building muxer");
    muxer.start().await.expect("starting muxer");
    muxer.wait_for_hot(Duration::from_secs(5)).await.expect("at least one destination should come up hot");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while muxer.hot() < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(muxer.hot(), 2, "both destinations should be hot before the torture run starts");

    let tag = muxer.get_tag("default").expect("default tag is always registered");

    // More than `die_after`'s 20 so the dying destination definitely still
    // has outstanding, unacked entries in its confirmation window when it
    // gets cut off.
    for i in 0..40u32 {
        muxer.write(entry(tag, i)).await.expect("enqueuing entry");
    }

    // The dying destination only notices its peer is gone on its next
    // periodic FORCE_ACK tick (1.5-3s jitter) once `EntryWriter::sync`'s
    // `connection_timeout_secs`-bounded wait (2s here) gives up on a window
    // that will never drain; only then does the supervisor recycle its
    // outstanding entries onto the survivor. Give that its own budget before
    // the final sync.
    tokio::time::sleep(Duration::from_secs(7)).await;

    muxer.sync(Duration::from_secs(20)).await.expect("sync should succeed once recycled work is delivered");

    let total_received = dying.received_payloads().await.len() + survivor.received_payloads().await.len();
    assert_eq!(total_received, 40, "every written entry should have landed on one indexer or the other");

    muxer.close().await.expect("closing muxer");
    dying.shutdown();
    survivor.shutdown();
}
