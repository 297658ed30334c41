// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Low-level record I/O shared by the auth handshake, the entry writer, and
//! the ack reader: every blocking I/O op races a timeout against a
//! shutdown [`CancellationToken`].

use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::wire::magic::RecordMagic;

pub async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("{label} cancelled")),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow!("{label} timeout")),
            }
        }
    }
}

/// Reads and classifies the next record's leading magic number.
pub async fn read_magic<R: AsyncRead + Unpin>(r: &mut R) -> Result<RecordMagic> {
    let v = r.read_u32_le().await?;
    RecordMagic::try_from(v)
}

pub async fn write_magic<W: AsyncWrite + Unpin>(w: &mut W, magic: u32) -> Result<()> {
    w.write_u32_le(magic).await?;
    Ok(())
}

/// Writes a `u32` length prefix followed by a JSON encoding of `value`,
/// enforcing `max_size` on the encoded length (4 KiB / 32 MiB /
/// 64 MiB caps per envelope kind).
pub async fn write_len_prefixed_json<W: AsyncWrite + Unpin, T: Serialize>(
    w: &mut W,
    value: &T,
    max_size: usize,
) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    if body.len() > max_size {
        bail!("envelope of {} bytes exceeds cap of {max_size}", body.len());
    }
    w.write_u32_le(body.len() as u32).await?;
    w.write_all(&body).await?;
    Ok(())
}

pub async fn read_len_prefixed_json<R: AsyncRead + Unpin, T: DeserializeOwned>(
    r: &mut R,
    max_size: usize,
) -> Result<T> {
    let len = r.read_u32_le().await? as usize;
    if len > max_size {
        bail!("envelope of {len} bytes exceeds cap of {max_size}");
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Same as [`write_len_prefixed_json`] but with a `u16` length prefix, used
/// by [`crate::wire::auth::StateResponse`].
pub async fn write_len_prefixed_json_u16<W: AsyncWrite + Unpin, T: Serialize>(
    w: &mut W,
    value: &T,
    max_size: usize,
) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    if body.len() > max_size {
        bail!("envelope of {} bytes exceeds cap of {max_size}", body.len());
    }
    w.write_u16_le(body.len() as u16).await?;
    w.write_all(&body).await?;
    Ok(())
}

pub async fn read_len_prefixed_json_u16<R: AsyncRead + Unpin, T: DeserializeOwned>(
    r: &mut R,
    max_size: usize,
) -> Result<T> {
    let len = r.read_u16_le().await? as usize;
    if len > max_size {
        bail!("envelope of {len} bytes exceeds cap of {max_size}");
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}
