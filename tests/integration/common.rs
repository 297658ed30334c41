// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A minimal in-process stand-in for a peer indexer: speaks just enough of
//! the wire protocol (`src/wire/*`) to take a connection all the way to Hot
//! and then read/confirm entries, the same sequence exercised by
//! `connection.rs`'s `full_handshake_over_an_in_memory_duplex` unit test,
//! replayed here over a real loopback socket instead of an in-memory duplex.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use ingest_mux::wire::auth::{AuthState, Challenge, ChallengeResponse, StateResponse, compute_challenge_response};
use ingest_mux::wire::control::{IngesterState, write_ditto_ack};
use ingest_mux::wire::entry_header::{FIXED_HEADER_LEN, SEND_ID_LEN, decode_fixed_header};
use ingest_mux::wire::framer::read_magic;
use ingest_mux::wire::magic::{CONFIRM_ENTRY_MAGIC, RecordMagic};
use ingest_mux::wire::tag_codec::{TagRequest, TagResponse};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

/// One entry as seen on the wire by a mock indexer: the remote tag id the
/// muxer translated it to, and the payload bytes.
#[derive(Debug, Clone)]
pub struct ReceivedEntry {
    pub remote_tag: u16,
    pub payload: Vec<u8>,
}

/// When a mock indexer connection should stop reading and drop its socket
/// with data still pending in the kernel receive buffer, simulating a sudden
/// peer death (the "reconnect with outstanding" scenario).
#[derive(Clone, Copy)]
pub enum DeathAfter {
    Never,
    Entries(usize),
}

#[derive(Clone)]
pub struct MockIndexerOpts {
    pub secret: Option<String>,
    pub die_after: DeathAfter,
}

impl Default for MockIndexerOpts {
    fn default() -> Self {
        Self { secret: None, die_after: DeathAfter::Never }
    }
}

/// A running mock indexer. Every accepted connection runs the same
/// handshake + read loop; `received` and `negotiated` are shared across all
/// of them, which is fine for these tests since each only ever opens one.
pub struct MockIndexer {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<ReceivedEntry>>>,
    pub negotiated: Arc<Mutex<HashMap<String, u16>>>,
    accept_task: JoinHandle<()>,
}

impl MockIndexer {
    pub async fn received_payloads(&self) -> Vec<Vec<u8>> {
        self.received.lock().await.iter().map(|e| e.payload.clone()).collect()
    }

    pub async fn remote_tag_for(&self, name: &str) -> Option<u16> {
        self.negotiated.lock().await.get(name).copied()
    }

    pub fn shutdown(self) {
        self.accept_task.abort();
    }
}

/// Binds a loopback listener up front (so the address is known) without yet
/// serving it.
pub async fn bind_loopback() -> Result<TcpListener> {
    TcpListener::bind("127.0.0.1:0").await.context("binding mock indexer listener")
}

/// Spawns a mock indexer that starts accepting immediately.
pub async fn spawn_mock_indexer(opts: MockIndexerOpts) -> Result<MockIndexer> {
    let listener = bind_loopback().await?;
    spawn_on(listener, opts, None)
}

/// Spawns a mock indexer bound to `listener` but that only starts calling
/// `accept` once `gate` resolves, so a test can hold a destination
/// "unreachable" after the client's SYN is already queued by the kernel
/// (the "no hot connections, then a destination starts" scenario).
pub fn spawn_mock_indexer_gated(
    listener: TcpListener,
    opts: MockIndexerOpts,
    gate: oneshot::Receiver<()>,
) -> MockIndexer {
    spawn_on(listener, opts, Some(gate))
}

fn spawn_on(listener: TcpListener, opts: MockIndexerOpts, gate: Option<oneshot::Receiver<()>>) -> MockIndexer {
    let addr = listener.local_addr().expect("bound listener has a local addr");
    let received = Arc::new(Mutex::new(Vec::new()));
    let negotiated = Arc::new(Mutex::new(HashMap::new()));
    let received_task = received.clone();
    let negotiated_task = negotiated.clone();

    let accept_task = tokio::spawn(async move {
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => return,
            };
            let opts = opts.clone();
            let received = received_task.clone();
            let negotiated = negotiated_task.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_one(stream, opts, received, negotiated).await {
                    tracing::debug!(error = %e, "mock indexer connection ended");
                }
            });
        }
    });

    MockIndexer { addr, received, negotiated, accept_task }
}

async fn serve_one(
    mut stream: TcpStream,
    opts: MockIndexerOpts,
    received: Arc<Mutex<Vec<ReceivedEntry>>>,
    negotiated: Arc<Mutex<HashMap<String, u16>>>,
) -> Result<()> {
    stream.set_nodelay(true).ok();

    let challenge = Challenge::generate();
    challenge.write(&mut stream).await.context("writing challenge")?;
    let expected = compute_challenge_response(
        opts.secret.as_deref().unwrap_or("").as_bytes(),
        &challenge.random,
        challenge.iterations,
    );
    let got = ChallengeResponse::read(&mut stream).await.context("reading challenge response")?;
    let verdict = if got == expected { AuthState::Authenticated } else { AuthState::NotAuthenticated };
    StateResponse::new(verdict, "mock indexer verdict").write(&mut stream).await?;
    if verdict != AuthState::Authenticated {
        anyhow::bail!("mock indexer rejected auth");
    }

    let mut next_remote_id: u16 = 100;
    negotiate(&mut stream, &negotiated, &mut next_remote_id).await.context("initial tag negotiation")?;

    read_control_envelope(&mut stream).await.context("reading IngesterId")?;
    read_control_envelope(&mut stream).await.context("reading StreamConfig")?;

    let hot = StateResponse::read(&mut stream).await.context("reading client's hot announcement")?;
    anyhow::ensure!(hot.state == AuthState::Hot, "client did not announce hot");
    StateResponse::new(AuthState::Hot, "accepted").write(&mut stream).await?;

    let mut confirmed = 0usize;
    loop {
        let magic = match read_magic(&mut stream).await {
            Ok(m) => m,
            Err(_) => return Ok(()), // client closed or reset the connection
        };
        match magic {
            RecordMagic::NewEntry => {
                let mut header_buf = [0u8; FIXED_HEADER_LEN];
                stream.read_exact(&mut header_buf).await?;
                let header = decode_fixed_header(&header_buf)?;
                let mut src = vec![0u8; header.src_len()];
                stream.read_exact(&mut src).await?;
                let mut send_id_buf = [0u8; SEND_ID_LEN];
                stream.read_exact(&mut send_id_buf).await?;
                let send_id = u64::from_le_bytes(send_id_buf);
                let mut payload = vec![0u8; header.data_len as usize];
                stream.read_exact(&mut payload).await?;
                if header.has_enum_values {
                    let len = stream.read_u32_le().await? as usize;
                    let mut discard = vec![0u8; len];
                    stream.read_exact(&mut discard).await?;
                }

                received.lock().await.push(ReceivedEntry { remote_tag: header.tag, payload });
                confirmed += 1;

                if let DeathAfter::Entries(n) = opts.die_after {
                    if confirmed >= n {
                        // Drop without acking and without a clean shutdown:
                        // the client's next read/write sees a reset instead
                        // of a graceful EOF.
                        return Ok(());
                    }
                }

                stream.write_u32_le(CONFIRM_ENTRY_MAGIC).await?;
                stream.write_u64_le(send_id).await?;
                stream.flush().await?;
            },
            RecordMagic::ForceAck => {},
            RecordMagic::TagRequest => {
                negotiate_mid_stream(&mut stream, &negotiated, &mut next_remote_id).await?;
            },
            RecordMagic::Ditto => {
                let len = stream.read_u32_le().await? as usize;
                let mut block = vec![0u8; len];
                stream.read_exact(&mut block).await?;
                write_ditto_ack(&mut stream, true).await?;
                stream.flush().await?;
            },
            RecordMagic::IngesterState => {
                read_control_envelope_tagged(&mut stream).await?;
            },
            other => {
                anyhow::bail!("mock indexer saw unexpected record {other:?} in the entry loop");
            },
        }
    }
}

/// Reads and discards a `u32 magic | u32 len | body` control envelope whose
/// magic was already consumed by the main loop's `read_magic`.
async fn read_control_envelope_tagged(stream: &mut TcpStream) -> Result<()> {
    let len = stream.read_u32_le().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    let _: IngesterState = serde_json::from_slice(&buf).context("decoding IngesterState")?;
    Ok(())
}

/// Reads a `u32 magic | u32 len | body` control envelope from scratch
/// (magic included), used for the two handshake-time envelopes that always
/// appear in a fixed position rather than being dispatched through
/// `read_magic`.
async fn read_control_envelope(stream: &mut TcpStream) -> Result<()> {
    let _magic = stream.read_u32_le().await?;
    let len = stream.read_u32_le().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(())
}

/// The initial, bare (un-magic-prefixed) tag negotiation that happens right
/// after authentication.
async fn negotiate(
    stream: &mut TcpStream,
    negotiated: &Arc<Mutex<HashMap<String, u16>>>,
    next_remote_id: &mut u16,
) -> Result<()> {
    let request = TagRequest::read(stream).await?;
    let response = assign_remote_ids(&request, negotiated, next_remote_id).await;
    response.write(stream).await?;
    Ok(())
}

/// A mid-stream `TagRequest`/`TagResponse` round trip, both magic-framed.
async fn negotiate_mid_stream(
    stream: &mut TcpStream,
    negotiated: &Arc<Mutex<HashMap<String, u16>>>,
    next_remote_id: &mut u16,
) -> Result<()> {
    let request = TagRequest::read(stream).await?;
    let response = assign_remote_ids(&request, negotiated, next_remote_id).await;
    stream.write_u32_le(ingest_mux::wire::magic::TAG_RESPONSE_MAGIC).await?;
    response.write(stream).await?;
    stream.flush().await?;
    Ok(())
}

async fn assign_remote_ids(
    request: &TagRequest,
    negotiated: &Arc<Mutex<HashMap<String, u16>>>,
    next_remote_id: &mut u16,
) -> TagResponse {
    let mut guard = negotiated.lock().await;
    let mut remote_ids = HashMap::new();
    for name in &request.names {
        let id = *guard.entry(name.clone()).or_insert_with(|| {
            let id = *next_remote_id;
            *next_remote_id += 1;
            id
        });
        remote_ids.insert(name.clone(), id);
    }
    TagResponse { remote_ids }
}
