// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The chan-cacher: a two-channel FIFO that transparently spills to a local
//! file spool. Whenever a push is actually spilling (`Always` mode, or
//! `Passthrough` with nothing hot), the record is appended to the spool
//! file before it's admitted to the live queue, so the file always holds a
//! superset of what's in memory and a crash never loses an accepted item.
//! `commit` is a periodic compaction that rewrites the file down to exactly
//! the current in-memory contents, dropping records for items already
//! popped. Startup replays whatever is on disk via [`Cacher::open`].

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::cfg::enums::CacheMode;
use crate::entry::model::{Batch, Entry};

/// A bound on how many items a `Fail`-mode cacher holds in memory before it
/// back-pressures the producer; `Fail` mode never touches disk, so there is
/// no byte budget to lean on instead.
const FAIL_MODE_BUFFER: usize = 256;

pub trait SpoolItem: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn byte_size(&self) -> u64;
}

impl SpoolItem for Entry {
    fn byte_size(&self) -> u64 {
        (self.payload.len() + 32) as u64
    }
}

impl SpoolItem for Batch {
    fn byte_size(&self) -> u64 {
        self.iter().map(SpoolItem::byte_size).sum::<u64>() + 16
    }
}

struct Spool<T> {
    path: PathBuf,
    items: VecDeque<T>,
    bytes: u64,
    file: fs::File,
}

fn encode_record<T: SpoolItem>(item: &T) -> Result<Vec<u8>> {
    let encoded = bincode::serialize(item)?;
    let mut record = Vec::with_capacity(4 + encoded.len());
    record.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    record.extend_from_slice(&encoded);
    Ok(record)
}

impl<T: SpoolItem> Spool<T> {
    async fn open_append(path: &Path) -> Result<fs::File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.ok();
        }
        fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .await
            .with_context(|| format!("opening spool file {}", path.display()))
    }

    async fn load(path: PathBuf) -> Result<Self> {
        let mut file = Self::open_append(&path).await?;
        let mut items = VecDeque::new();
        let mut bytes = 0u64;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        let mut cursor = &buf[..];
        while cursor.len() >= 4 {
            let len = u32::from_le_bytes(cursor[0..4].try_into().expect("checked len")) as usize;
            cursor = &cursor[4..];
            if cursor.len() < len {
                break;
            }
            let item: T = bincode::deserialize(&cursor[..len]).context("corrupt spool record")?;
            bytes += item.byte_size();
            items.push_back(item);
            cursor = &cursor[len..];
        }
        Ok(Self { path, items, bytes, file })
    }

    /// Appends one record to the spool file before admitting it to the live
    /// queue, so a crash between the two never loses an accepted item.
    /// `spill` gates the disk write: `Fail`-mode cachers keep `spill` false
    /// so they never touch disk at all, matching their "caching disabled"
    /// contract.
    async fn push(&mut self, item: T, spill: bool) -> Result<()> {
        if spill {
            let record = encode_record(&item)?;
            self.file.write_all(&record).await.context("appending spool record")?;
            self.file.flush().await?;
        }
        self.bytes += item.byte_size();
        self.items.push_back(item);
        Ok(())
    }

    fn pop(&mut self) -> Option<T> {
        let item = self.items.pop_front()?;
        self.bytes = self.bytes.saturating_sub(item.byte_size());
        Some(item)
    }

    /// Compacts the spool file down to exactly the current in-memory queue,
    /// dropping the on-disk records of everything already popped.
    async fn commit(&mut self) -> Result<()> {
        let mut out = Vec::new();
        for item in &self.items {
            out.extend_from_slice(&encode_record(item)?);
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &out).await?;
        fs::rename(&tmp, &self.path).await?;
        self.file = Self::open_append(&self.path).await?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn byte_len(&self) -> u64 {
        self.bytes
    }
}

/// Two-channel FIFO with three admission modes. `hot` is the
/// muxer-wide live-connection counter; a `Passthrough` cacher consults it on
/// every push to decide whether it should be spilling to disk right now.
pub struct Cacher<T: SpoolItem> {
    mode: CacheMode,
    max_bytes: u64,
    spool: Mutex<Spool<T>>,
    hot: Arc<AtomicUsize>,
    notify: Notify,
}

impl<T: SpoolItem> Cacher<T> {
    pub async fn open(
        path: impl AsRef<Path>,
        mode: CacheMode,
        max_bytes: u64,
        hot: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let spool = Spool::load(path.as_ref().to_path_buf()).await?;
        Ok(Self { mode, max_bytes, spool: Mutex::new(spool), hot, notify: Notify::new() })
    }

    fn should_spill_now(&self) -> bool {
        match self.mode {
            CacheMode::Always => true,
            CacheMode::Fail => false,
            CacheMode::Passthrough => self.hot.load(Ordering::Acquire) == 0,
        }
    }

    /// Enqueues one item, back-pressuring the caller per `mode` when the
    /// relevant budget is exhausted. Legacy behaviour blocks rather than
    /// drops when an "always"-mode spool hits its byte budget; see
    /// DESIGN.md for why that's kept as the default.
    pub async fn push(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        loop {
            {
                let spill = self.should_spill_now();
                let mut g = self.spool.lock().await;
                let would_exceed = if self.mode == CacheMode::Fail {
                    g.len() >= FAIL_MODE_BUFFER
                } else if spill {
                    g.byte_len() + item.byte_size() > self.max_bytes
                } else {
                    false
                };
                if !would_exceed {
                    g.push(item, spill).await?;
                    drop(g);
                    self.notify.notify_waiters();
                    return Ok(());
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("cacher push cancelled while waiting for room"),
                _ = tokio::time::sleep(Duration::from_millis(25)) => {},
            }
        }
    }

    /// Dequeues the next item, waiting for one to arrive.
    pub async fn pop(&self, cancel: &CancellationToken) -> Result<T> {
        loop {
            {
                let mut g = self.spool.lock().await;
                if let Some(item) = g.pop() {
                    return Ok(item);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("cacher pop cancelled"),
                _ = self.notify.notified() => {},
            }
        }
    }

    pub async fn try_pop(&self) -> Option<T> {
        self.spool.lock().await.pop()
    }

    pub async fn commit(&self) -> Result<()> {
        self.spool.lock().await.commit().await
    }

    pub async fn len(&self) -> usize {
        self.spool.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Loads the `tagcache` file (binary-encoded `name -> local id` map) beside
/// the entry/batch spools, if present.
pub async fn load_tag_cache(path: impl AsRef<Path>) -> Result<HashMap<String, u16>> {
    match fs::read(path.as_ref()).await {
        Ok(bytes) => bincode::deserialize(&bytes).context("corrupt tagcache file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

pub async fn save_tag_cache(path: impl AsRef<Path>, map: &HashMap<String, u16>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.ok();
    }
    let encoded = bincode::serialize(map)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &encoded).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
