// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! [`IngestMuxer`]: the public entry point. Owns the
//! entry/batch chan-cachers, the emergency queue, the muxer-wide tag
//! namespace, and one [`crate::supervisor::DestinationHandle`] per
//! destination; spawns a supervisor task per destination plus a pair of
//! dispatcher tasks that round-robin cached work onto whichever
//! destinations are currently hot.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cacher::{Cacher, load_tag_cache, save_tag_cache};
use crate::cfg::config::MuxerConfig;
use crate::connection::IngestConnection;
use crate::emergency::EmergencyQueue;
use crate::entry::model::{Batch, Entry, MAX_ENTRY_SIZE};
use crate::errors::MuxError;
use crate::ratelimiter::RateLimiter;
use crate::supervisor::{self, DestinationHandle};
use crate::tag::TagMap;

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

/// State shared by every destination's supervisor/relay task and by the
/// muxer's own dispatcher tasks. Kept separate from [`IngestMuxer`] so it
/// can be handed into `'static` spawned tasks as a single `Arc`.
pub struct MuxShared {
    pub config: MuxerConfig,
    pub tags: Arc<TagMap>,
    pub batch_cache: Arc<Cacher<Batch>>,
    pub emergency: Arc<EmergencyQueue>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub hot_count: Arc<AtomicUsize>,
    pub connections: Arc<DashMap<String, Arc<IngestConnection>>>,
    pub errors: Arc<DashMap<String, String>>,
    pub local_source: crate::entry::model::SourceAddr,
    pub cache_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl MuxShared {
    fn tagcache_path(&self) -> PathBuf {
        self.cache_dir.join("tagcache")
    }
}

/// The top-level fan-out engine: multiplexes tagged
/// entries submitted through [`Self::write`]/[`Self::write_batch`] across
/// every configured destination, automatically reconnecting and spilling
/// to disk as destinations go up and down.
pub struct IngestMuxer {
    shared: Arc<MuxShared>,
    entry_cache: Arc<Cacher<Entry>>,
    destinations: Arc<Vec<Arc<DestinationHandle>>>,
    state: AtomicU8,
    supervisor_tasks: TokioMutex<Vec<JoinHandle<()>>>,
    dispatcher_tasks: TokioMutex<Vec<JoinHandle<()>>>,
    write_barrier: CancellationToken,
    _cache_tempdir: Option<tempfile::TempDir>,
}

impl IngestMuxer {
    /// Builds a muxer from a validated configuration: opens (or creates)
    /// the on-disk spool and tag cache, but does not yet connect to any
    /// destination — that's [`Self::start`]'s job.
    pub async fn new(mut config: MuxerConfig) -> Result<Self> {
        config.validate_and_normalize()?;

        let (cache_dir, tempdir) = match &config.cache.path {
            Some(p) => (PathBuf::from(p), None),
            None => {
                let dir = tempfile::tempdir().context("creating temporary cache directory")?;
                let path = dir.path().to_path_buf();
                (path, Some(dir))
            },
        };

        let hot_count = Arc::new(AtomicUsize::new(0));
        let max_bytes = config.cache.max_size_mb.saturating_mul(1024 * 1024);
        let entry_cache = Arc::new(
            Cacher::open(cache_dir.join("entries.spool"), config.cache.mode, max_bytes, hot_count.clone())
                .await
                .context("opening entry spool")?,
        );
        let batch_cache = Arc::new(
            Cacher::open(cache_dir.join("batches.spool"), config.cache.mode, max_bytes, hot_count.clone())
                .await
                .context("opening batch spool")?,
        );

        let loaded_tags = load_tag_cache(cache_dir.join("tagcache")).await.context("loading tagcache")?;
        let tags = if loaded_tags.is_empty() {
            Arc::new(TagMap::new())
        } else {
            Arc::new(TagMap::from_snapshot(loaded_tags)?)
        };

        let rate_limiter =
            config.rate_limit.as_ref().map(|rl| Arc::new(RateLimiter::new(rl.bytes_per_second, rl.burst)));

        let destinations: Vec<Arc<DestinationHandle>> =
            config.destinations.iter().cloned().map(DestinationHandle::new).collect();
        let emergency = Arc::new(EmergencyQueue::new(config.emergency_queue_capacity));

        let shared = Arc::new(MuxShared {
            config,
            tags,
            batch_cache,
            emergency,
            rate_limiter,
            hot_count,
            connections: Arc::new(DashMap::new()),
            errors: Arc::new(DashMap::new()),
            local_source: crate::utils::detect_local_source_addr(),
            cache_dir,
            cancel: CancellationToken::new(),
        });

        Ok(Self {
            shared,
            entry_cache,
            destinations: Arc::new(destinations),
            state: AtomicU8::new(NOT_STARTED),
            supervisor_tasks: TokioMutex::new(Vec::new()),
            dispatcher_tasks: TokioMutex::new(Vec::new()),
            write_barrier: CancellationToken::new(),
            _cache_tempdir: tempdir,
        })
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            RUNNING => Ok(()),
            _ => Err(MuxError::NotRunning.into()),
        }
    }

    /// Spawns one supervisor task per destination plus the entry/batch
    /// dispatchers. Calling twice, or calling after [`Self::close`], is an
    /// error.
    pub async fn start(&self) -> Result<()> {
        match self.state.compare_exchange(NOT_STARTED, RUNNING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {},
            Err(RUNNING) => bail!(MuxError::AlreadyStarted),
            Err(_) => bail!(MuxError::AlreadyClosed),
        }

        let mut sup_tasks = self.supervisor_tasks.lock().await;
        for dest in self.destinations.iter() {
            let dest = dest.clone();
            let shared = self.shared.clone();
            sup_tasks.push(tokio::spawn(async move { supervisor::run_supervisor(dest, shared).await }));
        }
        drop(sup_tasks);

        let mut disp_tasks = self.dispatcher_tasks.lock().await;
        disp_tasks.push(spawn_entry_dispatcher(
            self.entry_cache.clone(),
            self.destinations.clone(),
            self.shared.clone(),
        ));
        disp_tasks.push(spawn_batch_dispatcher(
            self.shared.batch_cache.clone(),
            self.destinations.clone(),
            self.shared.clone(),
        ));
        Ok(())
    }

    /// Idempotent graceful shutdown: stops taking new work, lets every
    /// supervisor drain and close its connection, persists the spool and
    /// tag cache, and returns once everything has settled. Safe to call
    /// more than once, and safe to call even if [`Self::start`] never ran.
    pub async fn close(&self) -> Result<()> {
        let prev = self.state.swap(CLOSED, Ordering::AcqRel);
        if prev == CLOSED {
            return Ok(());
        }
        self.write_barrier.cancel();
        self.shared.cancel.cancel();

        if prev == RUNNING {
            let mut sup_tasks = self.supervisor_tasks.lock().await;
            for t in sup_tasks.drain(..) {
                let _ = t.await;
            }
            let mut disp_tasks = self.dispatcher_tasks.lock().await;
            for t in disp_tasks.drain(..) {
                t.abort();
            }
        }

        for entry in self.shared.emergency.drain() {
            let _ = tokio::time::timeout(
                Duration::from_millis(50),
                self.shared.batch_cache.push(vec![entry], &self.shared.cancel),
            )
            .await;
        }
        self.entry_cache.commit().await.context("committing entry spool on close")?;
        self.shared.batch_cache.commit().await.context("committing batch spool on close")?;
        save_tag_cache(self.shared.tagcache_path(), &self.shared.tags.snapshot())
            .await
            .context("saving tagcache on close")?;
        Ok(())
    }

    /// Enqueues one entry, blocking until there is room in the entry cache
    /// or `cancel` fires.
    pub async fn write_context(&self, entry: Entry, cancel: &CancellationToken) -> Result<()> {
        self.ensure_running()?;
        entry.validate_size().map_err(|_| {
            MuxError::OversizeEntry { size: entry.payload.len() as u64, max: MAX_ENTRY_SIZE }
        })?;
        if !self.shared.tags.is_known(entry.tag) {
            bail!(MuxError::UnknownTag(entry.tag));
        }
        tokio::select! {
            _ = self.write_barrier.cancelled() => bail!(MuxError::NotRunning),
            _ = cancel.cancelled() => bail!(MuxError::Timeout),
            res = self.entry_cache.push(entry, &self.shared.cancel) => res,
        }
    }

    pub async fn write(&self, entry: Entry) -> Result<()> {
        self.write_context(entry, &CancellationToken::new()).await
    }

    /// Like [`Self::write`], but gives up after `timeout` instead of
    /// waiting indefinitely for cache room.
    pub async fn write_entry_timeout(&self, entry: Entry, timeout: Duration) -> Result<()> {
        let cancel = CancellationToken::new();
        let timeout_guard = cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timeout_guard.cancel();
        });
        let res = self.write_context(entry, &cancel).await;
        timer.abort();
        res
    }

    /// Validates every entry up front (so a batch is rejected atomically,
    /// never partially enqueued) then pushes the whole batch as one unit.
    pub async fn write_batch_context(&self, batch: Batch, cancel: &CancellationToken) -> Result<()> {
        self.ensure_running()?;
        for e in &batch {
            e.validate_size()
                .map_err(|_| MuxError::OversizeEntry { size: e.payload.len() as u64, max: MAX_ENTRY_SIZE })?;
            if !self.shared.tags.is_known(e.tag) {
                bail!(MuxError::UnknownTag(e.tag));
            }
        }
        tokio::select! {
            _ = self.write_barrier.cancelled() => bail!(MuxError::NotRunning),
            _ = cancel.cancelled() => bail!(MuxError::Timeout),
            res = self.shared.batch_cache.push(batch, &self.shared.cancel) => res,
        }
    }

    pub async fn write_batch(&self, batch: Batch) -> Result<()> {
        self.write_batch_context(batch, &CancellationToken::new()).await
    }

    /// Synchronous bulk-block transfer to a named destination, bypassing
    /// the entry/batch caches entirely.
    pub async fn ditto_write_context(&self, destination_addr: &str, block: Vec<u8>) -> Result<()> {
        self.ensure_running()?;
        let dest = self
            .destinations
            .iter()
            .find(|d| d.config.address == destination_addr)
            .ok_or_else(|| anyhow::anyhow!("unknown destination {destination_addr:?}"))?;
        dest.ditto_write(block).await
    }

    pub fn get_tag(&self, name: &str) -> Option<u16> {
        self.shared.tags.get(name)
    }

    /// Registers a new tag (idempotent per name) and, for every currently
    /// live connection, queues it for mid-stream negotiation the next time
    /// that connection's writer-relay drains its translator.
    pub async fn negotiate_tag(&self, name: &str) -> Result<u16> {
        let id = self.shared.tags.get_or_register(name)?;
        save_tag_cache(self.shared.tagcache_path(), &self.shared.tags.snapshot())
            .await
            .context("persisting tagcache after negotiating a tag")?;
        for conn in self.shared.connections.iter() {
            conn.value().translator().register_for_negotiation(id, name.to_string());
        }
        Ok(id)
    }

    pub fn hot(&self) -> usize {
        self.shared.hot_count.load(Ordering::Acquire)
    }

    pub fn dead(&self) -> usize {
        self.shared.errors.len()
    }

    pub fn size(&self) -> usize {
        self.destinations.len()
    }

    /// Blocks until at least one destination is hot, every destination has
    /// permanently failed, or `timeout` elapses.
    pub async fn wait_for_hot(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.hot() >= 1 {
                return Ok(());
            }
            if self.dead() >= self.destinations.len() && !self.destinations.is_empty() {
                bail!(MuxError::AllConnsDown);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(MuxError::Timeout);
            }
            tokio::select! {
                _ = self.shared.cancel.cancelled() => bail!(MuxError::NotRunning),
                _ = tokio::time::sleep(Duration::from_millis(50)) => {},
            }
        }
    }

    /// Forces a FORCE_ACK flush on every currently live connection and
    /// waits (up to `timeout`) for all of them to fully drain their
    /// confirmation windows.
    pub async fn sync(&self, timeout: Duration) -> Result<()> {
        let live: Vec<Arc<IngestConnection>> = self.shared.connections.iter().map(|e| e.value().clone()).collect();
        if live.is_empty() {
            bail!(MuxError::AllConnsDown);
        }

        let fut = async {
            let mut set = tokio::task::JoinSet::new();
            for conn in live.iter().cloned() {
                set.spawn(async move { conn.sync().await });
            }
            let mut errs = Vec::new();
            let mut total = 0usize;
            while let Some(res) = set.join_next().await {
                total += 1;
                match res {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => errs.push(e),
                    Err(join_err) => errs.push(anyhow::anyhow!("sync task panicked: {join_err}")),
                }
            }
            (total, errs)
        };

        match tokio::time::timeout(timeout, fut).await {
            Ok((_, errs)) if errs.is_empty() => Ok(()),
            Ok((total, errs)) if errs.len() == total => bail!(MuxError::AllConnsDown),
            Ok((_, mut errs)) => Err(errs.pop().expect("non-empty, checked above")),
            Err(_) => bail!(MuxError::Timeout),
        }
    }
}

fn spawn_entry_dispatcher(
    entry_cache: Arc<Cacher<Entry>>,
    destinations: Arc<Vec<Arc<DestinationHandle>>>,
    shared: Arc<MuxShared>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cursor = AtomicUsize::new(0);
        loop {
            let entry = tokio::select! {
                _ = shared.cancel.cancelled() => break,
                res = entry_cache.pop(&shared.cancel) => match res {
                    Ok(e) => e,
                    Err(_) => break,
                },
            };
            route_entry(&destinations, &cursor, &shared, entry).await;
        }
    })
}

fn spawn_batch_dispatcher(
    batch_cache: Arc<Cacher<Batch>>,
    destinations: Arc<Vec<Arc<DestinationHandle>>>,
    shared: Arc<MuxShared>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cursor = AtomicUsize::new(0);
        loop {
            let batch = tokio::select! {
                _ = shared.cancel.cancelled() => break,
                res = batch_cache.pop(&shared.cancel) => match res {
                    Ok(b) => b,
                    Err(_) => break,
                },
            };
            route_batch(&destinations, &cursor, &shared, batch).await;
        }
    })
}

/// Round-robins starting from `cursor`, skipping destinations that aren't
/// currently hot, falling back to the emergency queue if none accept it
/// routing to whichever connection is hot.
async fn route_entry(
    destinations: &[Arc<DestinationHandle>],
    cursor: &AtomicUsize,
    shared: &Arc<MuxShared>,
    mut entry: Entry,
) {
    if !destinations.is_empty() {
        let start = cursor.fetch_add(1, Ordering::Relaxed) % destinations.len();
        for offset in 0..destinations.len() {
            let dest = &destinations[(start + offset) % destinations.len()];
            if !dest.is_hot() || dest.is_dead() {
                continue;
            }
            match dest.try_send_entry(entry) {
                Ok(()) => return,
                Err(returned) => entry = returned,
            }
        }
    }
    if let Err(dropped) = shared.emergency.push(entry) {
        warn!(tag = dropped.tag, "no hot destination and emergency queue full, dropping entry");
    }
}

async fn route_batch(
    destinations: &[Arc<DestinationHandle>],
    cursor: &AtomicUsize,
    shared: &Arc<MuxShared>,
    mut batch: Batch,
) {
    if !destinations.is_empty() {
        let start = cursor.fetch_add(1, Ordering::Relaxed) % destinations.len();
        for offset in 0..destinations.len() {
            let dest = &destinations[(start + offset) % destinations.len()];
            if !dest.is_hot() || dest.is_dead() {
                continue;
            }
            match dest.try_send_batch(batch) {
                Ok(()) => return,
                Err(returned) => batch = returned,
            }
        }
    }
    for entry in batch {
        if let Err(dropped) = shared.emergency.push(entry) {
            warn!(tag = dropped.tag, "no hot destination and emergency queue full, dropping batched entry");
        }
    }
}
