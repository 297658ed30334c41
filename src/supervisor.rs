// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-destination supervisor: owns one destination's full life cycle —
//! connect, run a writer-relay while hot, recycle outstanding work on
//! death, back off, and reconnect — until the muxer shuts down or a fatal
//! error (bad auth, refused tag set) retires the destination for good.
//! Generalizes a single-connection retry loop to "N independent
//! destinations, each with its own state machine."

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cfg::config::DestinationConfig;
use crate::connection::{ConnectError, IngestConnection};
use crate::entry::model::{Batch, Entry};
use crate::muxer::MuxShared;
use crate::relay::{self, DittoRequest, RelayExit};

const INITIAL_BACKOFF: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
const PER_DEST_CHANNEL_CAP: usize = 256;

/// The muxer-facing side of one destination: the channels a dispatcher
/// feeds and the flags reporting whether this destination currently
/// accepts entries. Outlives any individual connection attempt; the
/// supervisor loop reconnects underneath it.
pub struct DestinationHandle {
    pub config: DestinationConfig,
    hot: AtomicBool,
    dead: AtomicBool,
    entry_tx: mpsc::Sender<Entry>,
    entry_rx: Mutex<Option<mpsc::Receiver<Entry>>>,
    batch_tx: mpsc::Sender<Batch>,
    batch_rx: Mutex<Option<mpsc::Receiver<Batch>>>,
    ditto_tx: mpsc::Sender<DittoRequest>,
    ditto_rx: Mutex<Option<mpsc::Receiver<DittoRequest>>>,
}

impl DestinationHandle {
    pub fn new(config: DestinationConfig) -> Arc<Self> {
        let (entry_tx, entry_rx) = mpsc::channel(PER_DEST_CHANNEL_CAP);
        let (batch_tx, batch_rx) = mpsc::channel(PER_DEST_CHANNEL_CAP);
        let (ditto_tx, ditto_rx) = mpsc::channel(8);
        Arc::new(Self {
            config,
            hot: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            entry_tx,
            entry_rx: Mutex::new(Some(entry_rx)),
            batch_tx,
            batch_rx: Mutex::new(Some(batch_rx)),
            ditto_tx,
            ditto_rx: Mutex::new(Some(ditto_rx)),
        })
    }

    pub fn is_hot(&self) -> bool {
        self.hot.load(Ordering::Acquire)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Non-blocking routing attempt; used by the muxer's dispatcher to pick
    /// "whichever connection is hot".
    pub fn try_send_entry(&self, entry: Entry) -> Result<(), Entry> {
        self.entry_tx.try_send(entry).map_err(|e| match e {
            mpsc::error::TrySendError::Full(e) | mpsc::error::TrySendError::Closed(e) => e,
        })
    }

    pub fn try_send_batch(&self, batch: Batch) -> Result<(), Batch> {
        self.batch_tx.try_send(batch).map_err(|e| match e {
            mpsc::error::TrySendError::Full(b) | mpsc::error::TrySendError::Closed(b) => b,
        })
    }

    pub async fn ditto_write(&self, block: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.ditto_tx
            .send(DittoRequest { block, reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("destination {} has no live relay", self.config.address))?;
        rx.await.map_err(|_| anyhow::anyhow!("relay for {} dropped the ditto reply", self.config.address))?
    }

    /// Takes ownership of this destination's channels for the duration of
    /// one relay run; see [`Self::give_back_channels`].
    pub(crate) async fn take_channels(
        &self,
    ) -> (mpsc::Receiver<Entry>, mpsc::Receiver<Batch>, mpsc::Receiver<DittoRequest>) {
        let entry_rx = self.entry_rx.lock().await.take().expect("channels taken twice concurrently");
        let batch_rx = self.batch_rx.lock().await.take().expect("channels taken twice concurrently");
        let ditto_rx = self.ditto_rx.lock().await.take().expect("channels taken twice concurrently");
        (entry_rx, batch_rx, ditto_rx)
    }

    pub(crate) async fn give_back_channels(
        &self,
        entry_rx: mpsc::Receiver<Entry>,
        batch_rx: mpsc::Receiver<Batch>,
        ditto_rx: mpsc::Receiver<DittoRequest>,
    ) {
        *self.entry_rx.lock().await = Some(entry_rx);
        *self.batch_rx.lock().await = Some(batch_rx);
        *self.ditto_rx.lock().await = Some(ditto_rx);
    }
}

/// Connects, runs the writer-relay while hot, and loops reconnecting on a
/// transient failure until `shared.cancel` fires or a fatal error retires
/// the destination (Connecting → Hot → Dying → Reconnecting, terminal
/// Closed).
pub async fn run_supervisor(dest: Arc<DestinationHandle>, shared: Arc<MuxShared>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if shared.cancel.is_cancelled() {
            return;
        }

        match IngestConnection::connect(
            &dest.config,
            &shared.config,
            &shared.tags,
            shared.rate_limiter.clone(),
            shared.cancel.child_token(),
        )
        .await
        {
            Ok((conn, ack_task)) => {
                backoff = INITIAL_BACKOFF;
                shared.connections.insert(dest.config.address.clone(), conn.clone());
                dest.hot.store(true, Ordering::Release);
                shared.hot_count.fetch_add(1, Ordering::AcqRel);
                info!(destination = %dest.config.address, "connection hot");

                let exit = relay::run_relay(conn.clone(), dest.clone(), shared.clone()).await;

                dest.hot.store(false, Ordering::Release);
                shared.hot_count.fetch_sub(1, Ordering::AcqRel);
                shared.connections.remove(&dest.config.address);
                conn.close();
                let _ = ack_task.await;
                recycle_outstanding(&conn, &dest, &shared).await;

                match exit {
                    RelayExit::Shutdown => return,
                    RelayExit::ConnectionDied(e) => {
                        warn!(destination = %dest.config.address, error = %e, "connection died, reconnecting");
                    },
                }
            },
            Err(ConnectError::Fatal(e)) => {
                error!(destination = %dest.config.address, error = %e, "fatal connection error, retiring destination");
                dest.dead.store(true, Ordering::Release);
                shared.errors.insert(dest.config.address.clone(), e.to_string());
                return;
            },
            Err(ConnectError::Transient(e)) => {
                warn!(destination = %dest.config.address, error = %e, "transient connect failure, backing off {backoff:?}");
            },
        }

        if quitable_sleep(backoff, &shared.cancel).await {
            return;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn quitable_sleep(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(d) => false,
    }
}

/// Extracts a dead connection's unconfirmed entries, reverses their remote
/// tag ids back to local ones, and recycles each.
async fn recycle_outstanding(conn: &Arc<IngestConnection>, dest: &Arc<DestinationHandle>, shared: &Arc<MuxShared>) {
    for (_send_id, mut entry) in conn.drain_outstanding() {
        let remote = entry.tag;
        match conn.translator().reverse(remote) {
            Some(local) => entry.set_tag(local),
            None => {
                warn!(
                    destination = %dest.config.address,
                    remote_tag = remote,
                    "cannot reverse remote tag id on connection death, dropping outstanding entry"
                );
                continue;
            },
        }
        recycle_entry(entry, shared).await;
    }
}

/// Recycles one entry: first to the batch cache with a 1s timeout, then to
/// the emergency queue (the same recycle path used by
/// the writer-relay when a single write fails).
pub async fn recycle_entry(entry: Entry, shared: &Arc<MuxShared>) {
    let pushed = tokio::time::timeout(Duration::from_secs(1), shared.batch_cache.push(vec![entry.clone()], &shared.cancel))
        .await;
    if matches!(pushed, Ok(Ok(()))) {
        return;
    }
    if let Err(dropped) = shared.emergency.push(entry) {
        warn!(tag = dropped.tag, "emergency queue full, dropping recycled entry");
    }
}
