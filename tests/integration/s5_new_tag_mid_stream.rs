// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! New tag mid-stream: a tag negotiated after a connection is
//! already hot must trigger a magic-framed `TagRequest`/`TagResponse` round
//! trip on that live connection, and the next entry using it must carry the
//! freshly negotiated remote id.

use std::time::Duration;

use ingest_mux::cfg::config::{CacheConfig, DestinationConfig, IngesterIdentity, MuxerConfig};
use ingest_mux::cfg::enums::CacheMode;
use ingest_mux::entry::{Entry, SourceAddr};
use ingest_mux::muxer::IngestMuxer;

use crate::integration_tests::common::{MockIndexerOpts, spawn_mock_indexer};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tag_negotiated_after_connect_resolves_mid_stream() {
    let indexer = spawn_mock_indexer(MockIndexerOpts::default()).await.expect("spawning mock indexer");

    let cfg = MuxerConfig {
        destinations: vec![DestinationConfig {
            address: format!("tcp://{}", indexer.addr),
            secret: None,
            tenant: None,
            tls: None,
        }],
        cache: CacheConfig { mode: CacheMode::Always, path: None, max_size_mb: 16 },
        rate_limit: None,
        ingester: IngesterIdentity {
            name: "s5-test".into(),
            version: "0".into(),
            uuid: None,
            label: "".into(),
        },
        max_unconfirmed: 64,
        ack_flush_interval_ms: 10,
        connection_timeout_secs: 10,
        emergency_queue_capacity: 64,
    };

    let muxer = IngestMuxer::new(cfg).await.expect("building muxer");
    muxer.start().await.expect("starting muxer");
    muxer.wait_for_hot(Duration::from_secs(5)).await.expect("destination should come up hot");

    // Nothing has negotiated "foo" yet, on either side.
    assert!(muxer.get_tag("foo").is_none());
    assert!(indexer.remote_tag_for("foo").await.is_none());

    let local_foo = muxer.negotiate_tag("foo").await.expect("negotiating a brand new tag");
    assert_eq!(local_foo, 1, "\"default\" already holds local id 0");

    let payload = b"mid-stream-tagged".to_vec();
    muxer
        .write(Entry::new(0, 0, local_foo, SourceAddr::unset_v4(), payload.clone()))
        .await
        .expect("writing an entry under the newly negotiated tag");

    muxer.sync(Duration::from_secs(10)).await.expect("sync should succeed after mid-stream negotiation");

    let remote_foo =
        indexer.remote_tag_for("foo").await.expect("the mock indexer should have negotiated \"foo\"");
    let received = indexer.received_payloads().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], payload);

    let received_tags = indexer.received.lock().await;
    assert_eq!(received_tags[0].remote_tag, remote_foo, "the entry must carry the negotiated remote tag id");
    drop(received_tags);

    muxer.close().await.expect("closing muxer");
    indexer.shutdown();
}
