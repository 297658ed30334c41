// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The entry writer and its companion ack reader: one task owns the write
//! half and frames outgoing records, a second task owns the read half and
//! drains incoming ones, and both race a shared [`CancellationToken`]
//! against an I/O timeout via [`io_with_timeout`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::entry::confirm::ConfirmationWindow;
use crate::entry::model::Entry;
use crate::wire::control::{IngesterState, write_ditto_block, write_ingester_state};
use crate::wire::entry_header::encode_header;
use crate::wire::framer::io_with_timeout;
use crate::wire::magic::{
    CONFIRM_ENTRY_MAGIC, FORCE_ACK_MAGIC, NEW_ENTRY_MAGIC, RecordMagic, TAG_REQUEST_MAGIC,
};
use crate::wire::tag_codec::{TagRequest, TagResponse};

/// Allocates monotonically increasing send-IDs for one connection's
/// lifetime, starting at 1: zero is reserved on the wire to mean "force
/// ack" and must never be issued as a real send-ID. Restarts from 1 on
/// every reconnect, since the confirmation window it's paired with also
/// starts empty.
#[derive(Debug)]
pub struct SendIdAllocator(AtomicU64);

impl Default for SendIdAllocator {
    fn default() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl SendIdAllocator {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Frames and writes entries to one destination connection, tracking each
/// one in a [`ConfirmationWindow`] until the peer acks it.
pub struct EntryWriter<W> {
    writer: W,
    window: Arc<ConfirmationWindow>,
    ids: Arc<SendIdAllocator>,
    cancel: CancellationToken,
    io_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> EntryWriter<W> {
    pub fn new(
        writer: W,
        window: Arc<ConfirmationWindow>,
        ids: Arc<SendIdAllocator>,
        cancel: CancellationToken,
        io_timeout: Duration,
    ) -> Self {
        Self { writer, window, ids, cancel, io_timeout }
    }

    /// Writes one entry. Blocks on the confirmation window filling up before
    /// the frame ever reaches the wire, which is the writer's half of the
    /// back-pressure story (the other half lives in the emergency queue).
    pub async fn write_entry(&mut self, entry: Entry) -> Result<u64> {
        entry.validate_size()?;
        let send_id = self.ids.next();
        self.window.add(send_id, entry.clone()).await;
        if let Err(e) = self.write_framed(&entry, send_id).await {
            // the peer will never ack a frame that never made it onto the
            // wire, so pull our own placeholder back out immediately.
            self.window.confirm(send_id);
            return Err(e);
        }
        Ok(send_id)
    }

    pub async fn write_batch(&mut self, entries: Vec<Entry>) -> Result<Vec<u64>> {
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            ids.push(self.write_entry(entry).await?);
        }
        Ok(ids)
    }

    async fn write_framed(&mut self, entry: &Entry, send_id: u64) -> Result<()> {
        let header = encode_header(entry, send_id)?;
        io_with_timeout(
            "write entry magic",
            self.writer.write_u32_le(NEW_ENTRY_MAGIC),
            self.io_timeout,
            &self.cancel,
        )
        .await?;
        io_with_timeout(
            "write entry header",
            self.writer.write_all(&header),
            self.io_timeout,
            &self.cancel,
        )
        .await?;
        if !entry.payload.is_empty() {
            io_with_timeout(
                "write entry payload",
                self.writer.write_all(&entry.payload),
                self.io_timeout,
                &self.cancel,
            )
            .await?;
        }
        if let Some(values) = &entry.enum_values {
            let encoded = serde_json::to_vec(values)?;
            io_with_timeout(
                "write enum values length",
                self.writer.write_u32_le(encoded.len() as u32),
                self.io_timeout,
                &self.cancel,
            )
            .await?;
            io_with_timeout(
                "write enum values",
                self.writer.write_all(&encoded),
                self.io_timeout,
                &self.cancel,
            )
            .await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Sends a mid-stream `TagRequest` for names negotiated while this
    /// connection was already hot (the `toNegotiate` drain). The
    /// initial handshake's tag round-trip in
    /// [`crate::connection::IngestConnection::connect`] is unframed (both
    /// sides haven't yet agreed any other record might interleave); once
    /// entries and acks are flowing on the same socket we need a magic so
    /// the ack reader can tell a `TagResponse` apart from a `CONFIRM_ENTRY`.
    pub async fn write_tag_request(&mut self, request: &TagRequest) -> Result<()> {
        io_with_timeout(
            "write tag request magic",
            self.writer.write_u32_le(TAG_REQUEST_MAGIC),
            self.io_timeout,
            &self.cancel,
        )
        .await?;
        request.write(&mut self.writer).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Writes an opaque ditto replication block. The caller is responsible
    /// for waiting on the ack, which arrives asynchronously on the same
    /// connection's read half.
    pub async fn write_ditto(&mut self, block: &[u8]) -> Result<()> {
        write_ditto_block(&mut self.writer, block).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Pushes a periodic ingester-state envelope (a jittered timer tick).
    /// Purely informational to the peer; failure is reported to the caller
    /// but never tears down the confirmation window.
    pub async fn write_ingester_state(&mut self, state: &IngesterState) -> Result<()> {
        write_ingester_state(&mut self.writer, state).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Sends a FORCE_ACK and waits for the window to fully drain, i.e. for
    /// every outstanding send to have been confirmed. Used to implement a
    /// synchronous flush point between producer and destination.
    pub async fn sync(&mut self) -> Result<()> {
        io_with_timeout(
            "write force-ack magic",
            self.writer.write_u32_le(FORCE_ACK_MAGIC),
            self.io_timeout,
            &self.cancel,
        )
        .await?;
        self.writer.flush().await?;
        let deadline = tokio::time::Instant::now() + self.io_timeout;
        while !self.window.is_empty() {
            if self.cancel.is_cancelled() {
                anyhow::bail!("sync cancelled while waiting on confirmation window to drain");
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("sync timed out waiting on confirmation window to drain");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }
}

/// A single slot for a ditto block's pending ack. Ditto writes are
/// serialized by the connection's writer mutex, so at most one is ever in
/// flight on a given connection.
pub type DittoAckSlot = Arc<tokio::sync::Mutex<Option<tokio::sync::oneshot::Sender<bool>>>>;

/// A single slot for a mid-stream `TagResponse`. Like [`DittoAckSlot`], at
/// most one negotiation is ever in flight on a connection because
/// `negotiate_pending_tags` holds the writer lock for the whole round trip.
pub type TagResponsePendingSlot =
    Arc<tokio::sync::Mutex<Option<tokio::sync::oneshot::Sender<TagResponse>>>>;

/// Reads CONFIRM_ENTRY records (and, less often, DITTO_ACK records) off a
/// destination connection's read half and feeds them into its
/// [`ConfirmationWindow`] / pending-ditto slot. Runs as its own task for the
/// lifetime of the connection.
pub struct AckReader<R> {
    reader: R,
    window: Arc<ConfirmationWindow>,
    ditto_pending: DittoAckSlot,
    tag_response_pending: TagResponsePendingSlot,
    cancel: CancellationToken,
    io_timeout: Duration,
}

impl<R: AsyncRead + Unpin> AckReader<R> {
    pub fn new(
        reader: R,
        window: Arc<ConfirmationWindow>,
        ditto_pending: DittoAckSlot,
        tag_response_pending: TagResponsePendingSlot,
        cancel: CancellationToken,
        io_timeout: Duration,
    ) -> Self {
        Self { reader, window, ditto_pending, tag_response_pending, cancel, io_timeout }
    }

    /// Runs until cancelled or the connection errors out.
    pub async fn run(mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let raw = io_with_timeout(
                "read ack magic",
                self.reader.read_u32_le(),
                self.io_timeout,
                &self.cancel,
            )
            .await?;
            match RecordMagic::try_from(raw) {
                Ok(RecordMagic::ConfirmEntry) => {
                    let send_id = io_with_timeout(
                        "read confirmed send id",
                        self.reader.read_u64_le(),
                        self.io_timeout,
                        &self.cancel,
                    )
                    .await?;
                    self.window.confirm(send_id);
                },
                Ok(RecordMagic::DittoAck) => {
                    let success = io_with_timeout(
                        "read ditto ack payload",
                        self.reader.read_u8(),
                        self.io_timeout,
                        &self.cancel,
                    )
                    .await?
                        != 0;
                    if let Some(tx) = self.ditto_pending.lock().await.take() {
                        let _ = tx.send(success);
                    }
                },
                Ok(RecordMagic::TagResponse) => {
                    let response = TagResponse::read(&mut self.reader).await?;
                    if let Some(tx) = self.tag_response_pending.lock().await.take() {
                        let _ = tx.send(response);
                    }
                },
                Ok(other) => warn!("ack reader saw unexpected record {other:?}, ignoring"),
                Err(e) => warn!("ack reader saw unrecognized magic 0x{raw:08x}: {e}"),
            }
        }
    }
}
