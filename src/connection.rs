// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One live connection to a peer indexer: transport setup, the
//! authentication/tag-negotiation handshake, and the paired
//! [`EntryWriter`]/[`AckReader`] that carry entries once negotiation
//! completes. A locked write half plus a spawned read-loop task, both
//! racing a shared [`CancellationToken`].

use std::net::ToSocketAddrs as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, bail, ensure};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cfg::config::{DestinationConfig, IngesterIdentity, MuxerConfig, parse_destination_address};
use crate::cfg::enums::ConnType;
use crate::entry::confirm::ConfirmationWindow;
use crate::entry::model::{Batch, Entry};
use crate::entry::writer::{
    AckReader, DittoAckSlot, EntryWriter, SendIdAllocator, TagResponsePendingSlot,
};
use crate::ratelimiter::{RateLimiter, ThrottledWriter};
use crate::tag::TagMap;
use crate::translator::TagTranslator;
use crate::wire::auth::{AuthState, StateResponse, client_authenticate};
use crate::wire::control::{StreamConfig, write_ingester_id, write_stream_config};
use crate::wire::tag_codec::{TagRequest, TagResponse};

/// Whether a connection-attempt failure is worth retrying: a `Transient`
/// failure backs off and retries; a `Fatal` one terminates the supervisor
/// for that destination permanently.
#[derive(Debug)]
pub enum ConnectError {
    Fatal(anyhow::Error),
    Transient(anyhow::Error),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Fatal(e) => write!(f, "fatal: {e}"),
            ConnectError::Transient(e) => write!(f, "transient: {e}"),
        }
    }
}

impl std::error::Error for ConnectError {}

impl ConnectError {
    pub fn into_inner(self) -> anyhow::Error {
        match self {
            ConnectError::Fatal(e) | ConnectError::Transient(e) => e,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectError::Fatal(_))
    }
}

/// Any transport the muxer can speak entries over. `tcp://`/`tls://`/
/// `pipe://` each produce a different concrete stream type; boxing behind
/// this trait lets the rest of the connection be generic over just one.
pub trait DuplexStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> DuplexStream for T {}

type BoxedStream = Box<dyn DuplexStream>;
type Writer = ThrottledWriter<WriteHalf<BoxedStream>>;

/// Accepts every server certificate without validation; used only when a
/// destination's `VerifyServer` is explicitly set to `false`.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

fn build_tls_connector(verify_server: bool) -> Result<TlsConnector> {
    let config = if verify_server {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder().with_root_certificates(roots).with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Opens the raw transport for `dest`, performing DNS resolution and the TLS
/// handshake where applicable. Does not yet speak the application protocol.
async fn connect_transport(dest: &DestinationConfig) -> Result<BoxedStream> {
    let (conn_type, remainder) = parse_destination_address(&dest.address)?;
    match conn_type {
        ConnType::Tcp => {
            let stream = TcpStream::connect(&remainder)
                .await
                .with_context(|| format!("connecting to {}", dest.address))?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream))
        },
        ConnType::Tls => {
            let tls_cfg = dest
                .tls
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("destination {} is tls:// but has no Tls config", dest.address))?;
            if tls_cfg.client_cert_path.is_some() || tls_cfg.client_key_path.is_some() {
                warn!(
                    destination = %dest.address,
                    "client certificate authentication is not implemented; connecting without one"
                );
            }
            let tcp = TcpStream::connect(&remainder)
                .await
                .with_context(|| format!("connecting to {}", dest.address))?;
            tcp.set_nodelay(true).ok();
            let connector = build_tls_connector(tls_cfg.verify_server)?;
            let host = remainder.split(':').next().unwrap_or(&remainder).to_string();
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| anyhow::anyhow!("invalid TLS server name {host:?}"))?
                .to_owned();
            let stream = connector
                .connect(server_name, tcp)
                .await
                .with_context(|| format!("TLS handshake with {}", dest.address))?;
            Ok(Box::new(stream))
        },
        ConnType::Pipe => {
            let stream = UnixStream::connect(&remainder)
                .await
                .with_context(|| format!("connecting to unix socket {remainder}"))?;
            Ok(Box::new(stream))
        },
    }
}

/// A live connection to one indexer: the negotiated tag translator, the
/// locked entry writer, and a handle to the background ack-reader task.
pub struct IngestConnection {
    pub destination: String,
    translator: Arc<TagTranslator>,
    writer: Mutex<EntryWriter<Writer>>,
    window: Arc<ConfirmationWindow>,
    ditto_pending: DittoAckSlot,
    tag_response_pending: TagResponsePendingSlot,
    negotiate_timeout: std::time::Duration,
    cancel: CancellationToken,
}

impl IngestConnection {
    /// Connects, authenticates, negotiates every tag the muxer currently
    /// knows about, and spawns the ack-reader task. Returns the connection
    /// plus a handle the caller (the supervisor) should watch for the
    /// read-loop's eventual exit.
    ///
    /// Network/timeout/protocol problems are [`ConnectError::Transient`]
    /// (the supervisor backs off and retries); a refused auth or tag set is
    /// [`ConnectError::Fatal`] (the supervisor gives up on this destination
    /// for good).
    pub async fn connect(
        dest: &DestinationConfig,
        cfg: &MuxerConfig,
        tags: &TagMap,
        rate_limiter: Option<Arc<RateLimiter>>,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, JoinHandle<Result<()>>), ConnectError> {
        let mut stream = tokio::time::timeout(cfg.connection_timeout(), connect_transport(dest))
            .await
            .map_err(|_| {
                ConnectError::Transient(anyhow::anyhow!("timed out connecting to {}", dest.address))
            })?
            .map_err(ConnectError::Transient)?;

        // Every step below is a bare read/write with no cancellation hook of
        // its own (unlike the entry writer/ack reader, which race
        // `io_with_timeout` once the connection is established); a peer that
        // accepts the TCP connection but then stalls mid-handshake would
        // otherwise hang this task, and with it the supervisor loop that
        // owns it, forever. One timeout around the whole handshake bounds
        // that the same way `connect_transport`'s timeout bounds the dial.
        let translator = Arc::new(TagTranslator::new());
        let handshake = async {
            client_authenticate(&mut stream, dest.secret.as_deref())
                .await
                .map_err(|e| {
                    ConnectError::Fatal(anyhow::anyhow!("authentication with {} refused: {e}", dest.address))
                })?;

            negotiate_tags(&mut stream, tags, &translator).await.map_err(ConnectError::Fatal)?;

            write_ingester_id(&mut stream, &cfg.ingester).await.map_err(ConnectError::Transient)?;
            let stream_cfg =
                StreamConfig { tenant: dest.tenant.clone(), config_json: None, metadata_json: None };
            write_stream_config(&mut stream, &stream_cfg).await.map_err(ConnectError::Transient)?;

            StateResponse::new(AuthState::Hot, "ready")
                .write(&mut stream)
                .await
                .map_err(ConnectError::Transient)?;
            let verdict = StateResponse::read(&mut stream)
                .await
                .context("reading IngestOK after announcing hot")
                .map_err(ConnectError::Transient)?;
            if verdict.state != AuthState::Hot {
                return Err(ConnectError::Transient(anyhow::anyhow!(
                    "peer did not accept {}'s hot announcement: {}",
                    dest.address,
                    verdict.info
                )));
            }
            Ok(())
        };
        match tokio::time::timeout(cfg.connection_timeout(), handshake).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(ConnectError::Transient(anyhow::anyhow!(
                    "handshake with {} timed out",
                    dest.address
                )));
            },
        }

        info!(destination = %dest.address, tags = translator.len(), "connection negotiated");

        let (read_half, write_half) = tokio::io::split(stream);
        let window = Arc::new(ConfirmationWindow::new(cfg.max_unconfirmed));
        let ids = Arc::new(SendIdAllocator::default());

        let limiter = rate_limiter.unwrap_or_else(|| Arc::new(RateLimiter::new(u64::MAX / 2, u64::MAX / 2)));
        let throttled = ThrottledWriter::new(write_half, limiter, cancel.clone());
        let writer = EntryWriter::new(throttled, window.clone(), ids, cancel.clone(), cfg.connection_timeout());

        let ditto_pending: DittoAckSlot = Arc::new(tokio::sync::Mutex::new(None));
        let tag_response_pending: TagResponsePendingSlot = Arc::new(tokio::sync::Mutex::new(None));
        let ack_reader = AckReader::new(
            read_half,
            window.clone(),
            ditto_pending.clone(),
            tag_response_pending.clone(),
            cancel.clone(),
            cfg.connection_timeout(),
        );
        let ack_task = tokio::spawn(ack_reader.run());

        let conn = Arc::new(Self {
            destination: dest.address.clone(),
            translator,
            writer: Mutex::new(writer),
            window,
            ditto_pending,
            tag_response_pending,
            negotiate_timeout: cfg.connection_timeout(),
            cancel,
        });
        Ok((conn, ack_task))
    }

    pub fn translator(&self) -> &Arc<TagTranslator> {
        &self.translator
    }

    pub async fn write_entry(&self, entry: Entry) -> Result<u64> {
        self.writer.lock().await.write_entry(entry).await
    }

    pub async fn write_batch(&self, entries: Batch) -> Result<Vec<u64>> {
        self.writer.lock().await.write_batch(entries).await
    }

    pub async fn sync(&self) -> Result<()> {
        self.writer.lock().await.sync().await
    }

    pub async fn push_ingester_state(&self, state: &crate::wire::control::IngesterState) -> Result<()> {
        self.writer.lock().await.write_ingester_state(state).await
    }

    /// Synchronous bulk-block transfer for indexer-to-indexer replication:
    /// writes the block and blocks until this connection's ack reader
    /// delivers the peer's callback or `timeout` elapses.
    pub async fn ditto_write(&self, block: &[u8], timeout: std::time::Duration) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        {
            let mut slot = self.ditto_pending.lock().await;
            ensure!(slot.is_none(), "a ditto block is already in flight on {}", self.destination);
            *slot = Some(tx);
        }
        if let Err(e) = self.writer.lock().await.write_ditto(block).await {
            self.ditto_pending.lock().await.take();
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => bail!("ditto block rejected by {}", self.destination),
            Ok(Err(_)) => bail!("ditto ack channel closed on {} (connection died)", self.destination),
            Err(_) => {
                self.ditto_pending.lock().await.take();
                bail!("ditto ack from {} timed out", self.destination)
            },
        }
    }

    /// Drains this connection's translator `toNegotiate` queue and runs a
    /// mid-stream TagRequest/TagResponse round trip for it (the
    /// writer-relay's "negotiate-or-reconnect" path). Returns `Ok(false)`
    /// with nothing sent if there was nothing pending.
    pub async fn negotiate_pending_tags(&self) -> Result<bool> {
        let pending = self.translator.drain_pending();
        if pending.is_empty() {
            return Ok(false);
        }
        let names: Vec<String> = pending.iter().map(|(_, name)| name.clone()).collect();
        let request = match TagRequest::new(names) {
            Ok(r) => r,
            Err(e) => {
                for (local, name) in &pending {
                    self.translator.register_for_negotiation(*local, name.clone());
                }
                return Err(e);
            },
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        *self.tag_response_pending.lock().await = Some(tx);
        if let Err(e) = self.writer.lock().await.write_tag_request(&request).await {
            self.tag_response_pending.lock().await.take();
            bail!("writing mid-stream TagRequest to {}: {e}", self.destination);
        }

        let response = match tokio::time::timeout(self.negotiate_timeout, rx).await {
            Ok(Ok(r)) => r,
            Ok(Err(_)) => bail!("tag response channel closed on {} (connection died)", self.destination),
            Err(_) => {
                self.tag_response_pending.lock().await.take();
                bail!("mid-stream tag negotiation with {} timed out", self.destination)
            },
        };
        if response.is_refusal() {
            bail!("mid-stream tag negotiation refused by {}", self.destination);
        }
        for (local, name) in &pending {
            let remote = response
                .remote_ids
                .get(name)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("TagResponse omitted tag {name:?}"))?;
            self.translator.register_tag(*local, remote)?;
        }
        Ok(true)
    }

    /// Everything that was sent but never acked; used to recycle an entry's
    /// worth of work into the emergency queue when this connection dies.
    pub fn outstanding(&self) -> Vec<(u64, Entry)> {
        self.window.outstanding()
    }

    pub fn drain_outstanding(&self) -> Vec<(u64, Entry)> {
        self.window.drain_all()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Sends a `TagRequest` listing every name the muxer currently knows (in
/// local-id order, so the response's remote ids line up positionally with
/// the translator's strict-monotonicity requirement) and registers the
/// returned remote ids.
async fn negotiate_tags<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(
    stream: &mut S,
    tags: &TagMap,
    translator: &TagTranslator,
) -> Result<()> {
    let names = ordered_tag_names(tags);
    let request = TagRequest::new(names.clone())?;
    request.write(stream).await.context("writing TagRequest")?;

    let response = TagResponse::read(stream).await.context("reading TagResponse")?;
    if response.is_refusal() {
        bail!("tag negotiation refused (empty TagResponse)");
    }
    for (local, name) in names.iter().enumerate() {
        let remote = response
            .remote_ids
            .get(name)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("TagResponse omitted tag {name:?}"))?;
        translator.register_tag(local as u16, remote)?;
    }
    Ok(())
}

fn ordered_tag_names(tags: &TagMap) -> Vec<String> {
    (0..tags.len() as u16).filter_map(|id| tags.name_of(id)).collect()
}

/// Tracks live connection count for the process; shared with the chan-cacher
/// so a `Passthrough` cacher knows whether anything is hot right now.
pub fn new_hot_counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

pub fn mark_hot(hot: &AtomicUsize) {
    hot.fetch_add(1, Ordering::AcqRel);
}

pub fn mark_not_hot(hot: &AtomicUsize) {
    hot.fetch_sub(1, Ordering::AcqRel);
}
