// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Control-plane envelopes: ingester identification, stream configuration,
//! periodic ingester-state pushes, and the opaque "ditto" bulk block used
//! for indexer-to-indexer replication. The wire format table only names
//! these as "additional control magics"; we frame each the same way as the
//! tag envelopes (`u32` magic, `u32` length, JSON body) to stay inside the
//! established conventions rather than invent a one-off shape per record.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cfg::config::IngesterIdentity;
use crate::wire::magic::{
    DITTO_ACK_MAGIC, DITTO_MAGIC, INGESTER_ID_MAGIC, INGESTER_STATE_MAGIC, STREAM_CONFIG_MAGIC,
};

const MAX_CONTROL_ENVELOPE_SIZE: usize = 1024 * 1024;
const MAX_DITTO_BLOCK_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IngesterIdWire {
    name: String,
    version: String,
    uuid: Option<String>,
    label: String,
}

/// Sent once per connection right after tag negotiation.
pub async fn write_ingester_id<W: AsyncWrite + Unpin>(
    w: &mut W,
    identity: &IngesterIdentity,
) -> Result<()> {
    w.write_u32_le(INGESTER_ID_MAGIC).await?;
    let wire = IngesterIdWire {
        name: identity.name.clone(),
        version: identity.version.clone(),
        uuid: identity.uuid.clone(),
        label: identity.label.clone(),
    };
    let body = serde_json::to_vec(&wire)?;
    w.write_u32_le(body.len() as u32).await?;
    w.write_all(&body).await?;
    Ok(())
}

/// Optional per-destination configuration/metadata blob (e.g. tenant).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    pub tenant: Option<String>,
    pub config_json: Option<String>,
    pub metadata_json: Option<String>,
}

pub async fn write_stream_config<W: AsyncWrite + Unpin>(
    w: &mut W,
    cfg: &StreamConfig,
) -> Result<()> {
    w.write_u32_le(STREAM_CONFIG_MAGIC).await?;
    let body = serde_json::to_vec(cfg)?;
    w.write_u32_le(body.len() as u32).await?;
    w.write_all(&body).await?;
    Ok(())
}

/// Periodic push describing this ingester's current state; the writer-relay
/// timer emits one every 1.5-3s jitter tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngesterState {
    pub hot_connections: usize,
    pub dead_connections: usize,
    pub cache_size_bytes: u64,
    pub emergency_queue_len: usize,
}

pub async fn write_ingester_state<W: AsyncWrite + Unpin>(
    w: &mut W,
    state: &IngesterState,
) -> Result<()> {
    w.write_u32_le(INGESTER_STATE_MAGIC).await?;
    let body = serde_json::to_vec(state)?;
    if body.len() > MAX_CONTROL_ENVELOPE_SIZE {
        anyhow::bail!("ingester state envelope of {} bytes too large", body.len());
    }
    w.write_u32_le(body.len() as u32).await?;
    w.write_all(&body).await?;
    Ok(())
}

/// A synchronous bulk-block transfer used for indexer-to-indexer
/// replication (`DittoWriteContext`). The block itself is opaque to the
/// muxer; only its length is framed.
pub async fn write_ditto_block<W: AsyncWrite + Unpin>(w: &mut W, block: &[u8]) -> Result<()> {
    if block.len() > MAX_DITTO_BLOCK_SIZE {
        anyhow::bail!("ditto block of {} bytes exceeds cap", block.len());
    }
    w.write_u32_le(DITTO_MAGIC).await?;
    w.write_u32_le(block.len() as u32).await?;
    w.write_all(block).await?;
    Ok(())
}

/// Writes the peer's acknowledgement of a ditto block: `DITTO_ACK_MAGIC |
/// u8 success`. Framed with its own magic (rather than a bare byte) so the
/// ack reader's single record loop can dispatch it the same way it
/// dispatches `CONFIRM_ENTRY_MAGIC`.
pub async fn write_ditto_ack<W: AsyncWrite + Unpin>(w: &mut W, success: bool) -> Result<()> {
    w.write_u32_le(DITTO_ACK_MAGIC).await?;
    w.write_u8(success as u8).await?;
    Ok(())
}

/// Reads a ditto ack's payload once the caller has already consumed the
/// leading `DITTO_ACK_MAGIC`.
pub async fn read_ditto_ack_payload<R: AsyncRead + Unpin>(r: &mut R) -> Result<bool> {
    Ok(r.read_u8().await? != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ingester_id_round_trips_through_json() {
        let identity = IngesterIdentity {
            name: "demo-ingester".into(),
            version: "1.0".into(),
            uuid: Some("abc-123".into()),
            label: "prod".into(),
        };
        let mut buf = Vec::new();
        write_ingester_id(&mut buf, &identity).await.unwrap();
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), INGESTER_ID_MAGIC);
        let len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        let decoded: IngesterIdWire = serde_json::from_slice(&buf[8..8 + len]).unwrap();
        assert_eq!(decoded.name, "demo-ingester");
        assert_eq!(decoded.uuid.as_deref(), Some("abc-123"));
    }

    #[tokio::test]
    async fn ditto_block_round_trips() {
        let mut buf = Vec::new();
        write_ditto_block(&mut buf, b"block-bytes").await.unwrap();
        let mut cur = std::io::Cursor::new(buf);
        let magic = cur.read_u32_le().await.unwrap();
        assert_eq!(magic, DITTO_MAGIC);
        let len = cur.read_u32_le().await.unwrap() as usize;
        let mut body = vec![0u8; len];
        cur.read_exact(&mut body).await.unwrap();
        assert_eq!(body, b"block-bytes");
    }

    #[tokio::test]
    async fn ditto_ack_round_trips() {
        let mut buf = Vec::new();
        write_ditto_ack(&mut buf, true).await.unwrap();
        let mut cur = std::io::Cursor::new(buf);
        let magic = cur.read_u32_le().await.unwrap();
        assert_eq!(magic, DITTO_ACK_MAGIC);
        assert!(read_ditto_ack_payload(&mut cur).await.unwrap());
    }
}
