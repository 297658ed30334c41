// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The writer-relay: a per-destination task that moves entries
//! from the destination's channels onto the wire once its connection is
//! hot, and runs the periodic sync/state-push/emergency-drain timer. Exits
//! back to the supervisor when the connection errors out or the muxer
//! shuts down.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Result, anyhow};
use rand::Rng;
use tokio::sync::oneshot;
use tracing::warn;

use crate::connection::IngestConnection;
use crate::entry::model::{Batch, Entry};
use crate::muxer::MuxShared;
use crate::supervisor::{DestinationHandle, recycle_entry};
use crate::wire::control::IngesterState;

/// A caller's request for a synchronous ditto bulk-block transfer (spec
/// §4.7's `DittoWriteContext`), queued to whichever destination the caller
/// named.
pub struct DittoRequest {
    pub block: Vec<u8>,
    pub reply: oneshot::Sender<Result<()>>,
}

/// Why a relay loop stopped.
pub enum RelayExit {
    /// The muxer is shutting down; the supervisor should not reconnect.
    Shutdown,
    /// The connection errored out; the supervisor should back off and
    /// retry.
    ConnectionDied(anyhow::Error),
}

/// Periodic tick, jittered 1.5-3s.
fn jittered_tick() -> Duration {
    let ms = rand::rng().random_range(1_500..3_000);
    Duration::from_millis(ms)
}

/// Runs until the connection dies or the muxer shuts down. Takes the
/// destination's channels for the duration of the run and hands them back
/// before returning, so the same [`DestinationHandle`] can be reused across
/// reconnects.
pub async fn run_relay(
    conn: Arc<IngestConnection>,
    dest: Arc<DestinationHandle>,
    shared: Arc<MuxShared>,
) -> RelayExit {
    let (mut entry_rx, mut batch_rx, mut ditto_rx) = dest.take_channels().await;
    let mut ticker = tokio::time::interval(jittered_tick());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => {
                let _ = conn.sync().await;
                break RelayExit::Shutdown;
            }

            maybe = entry_rx.recv() => {
                let Some(entry) = maybe else { break RelayExit::Shutdown };
                if let Err(e) = handle_entry(&conn, &shared, entry).await {
                    break RelayExit::ConnectionDied(e);
                }
            }

            maybe = batch_rx.recv() => {
                let Some(batch) = maybe else { break RelayExit::Shutdown };
                if let Err(e) = handle_batch(&conn, &shared, batch).await {
                    break RelayExit::ConnectionDied(e);
                }
            }

            maybe = ditto_rx.recv() => {
                let Some(req) = maybe else { break RelayExit::Shutdown };
                let result = conn.ditto_write(&req.block, shared.config.connection_timeout()).await;
                let _ = req.reply.send(result);
            }

            _ = ticker.tick() => {
                if let Err(e) = conn.sync().await {
                    break RelayExit::ConnectionDied(e);
                }
                drain_emergency(&conn, &shared).await;
                push_ingester_state(&conn, &shared).await;
            }
        }

        // When >1 connection is live, after each write the
        // relay yields cooperatively so the scheduler can spread load."
        tokio::task::yield_now().await;
    };

    dest.give_back_channels(entry_rx, batch_rx, ditto_rx).await;
    exit
}

/// Resolves `local_tag` against `conn`'s translator, attempting a
/// mid-stream negotiation first if the translator doesn't have it yet.
/// `Ok(None)` means the muxer itself has never heard of this tag (spec
/// §4.7: "If the muxer has never heard of the tag, log and drop").
async fn resolve_remote_tag(
    conn: &Arc<IngestConnection>,
    shared: &Arc<MuxShared>,
    local_tag: u16,
) -> Result<Option<u16>> {
    if let Some(remote) = conn.translator().translate(local_tag) {
        return Ok(Some(remote));
    }
    if !shared.tags.is_known(local_tag) {
        warn!(tag = local_tag, "dropping entry with a tag unknown to the muxer");
        return Ok(None);
    }
    conn.negotiate_pending_tags().await?;
    match conn.translator().translate(local_tag) {
        Some(remote) => Ok(Some(remote)),
        None => Err(anyhow!("tag {local_tag} still unresolved after negotiation")),
    }
}

async fn handle_entry(conn: &Arc<IngestConnection>, shared: &Arc<MuxShared>, mut entry: Entry) -> Result<()> {
    let local_tag = entry.tag;
    let remote_tag = match resolve_remote_tag(conn, shared, local_tag).await {
        Ok(Some(r)) => r,
        Ok(None) => return Ok(()),
        Err(e) => {
            // Tag still local (never translated), per the translator's
            // "entry is returned to the emergency queue with its tag not
            // reversed".
            recycle_entry(entry, shared).await;
            return Err(e);
        },
    };
    entry.set_source_if_unset(shared.local_source.clone());
    let mut wire_entry = entry.clone();
    wire_entry.set_tag(remote_tag);
    if let Err(e) = conn.write_entry(wire_entry).await {
        recycle_entry(entry, shared).await;
        return Err(e);
    }
    Ok(())
}

/// If the writer accepted only the first n entries of a batch,
/// only recycle the remaining len-n."
async fn handle_batch(conn: &Arc<IngestConnection>, shared: &Arc<MuxShared>, batch: Batch) -> Result<()> {
    let mut iter = batch.into_iter();
    while let Some(entry) = iter.next() {
        if let Err(e) = handle_entry(conn, shared, entry).await {
            for remaining in iter {
                recycle_entry(remaining, shared).await;
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Drains a bounded number of entries from the emergency queue into the
/// current hot connection every tick, rather than trying to empty it in one
/// go and starving the entry/batch channels.
const EMERGENCY_DRAIN_PER_TICK: usize = 32;

async fn drain_emergency(conn: &Arc<IngestConnection>, shared: &Arc<MuxShared>) {
    for _ in 0..EMERGENCY_DRAIN_PER_TICK {
        let Some(entry) = shared.emergency.pop() else { break };
        if let Err(e) = handle_entry(conn, shared, entry).await {
            warn!(error = %e, "failed to drain an emergency-queue entry, will retry on reconnect");
            break;
        }
    }
}

async fn push_ingester_state(conn: &Arc<IngestConnection>, shared: &Arc<MuxShared>) {
    let state = IngesterState {
        hot_connections: shared.hot_count.load(Ordering::Acquire),
        dead_connections: shared.errors.len(),
        cache_size_bytes: shared.batch_cache.len().await as u64,
        emergency_queue_len: shared.emergency.len(),
    };
    if let Err(e) = conn.push_ingester_state(&state).await {
        warn!(error = %e, "failed to push ingester state");
    }
}
