// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Tag-name negotiation envelopes.

use std::collections::HashMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::wire::{
    framer::{read_len_prefixed_json, write_len_prefixed_json},
    magic::{MAX_TAG_REQUEST_SIZE, MAX_TAG_RESPONSE_SIZE},
};

/// Characters forbidden in a tag name.
pub const FORBIDDEN_TAG_CHARS: &str = "!@#$%^&*()=+<>,.:;";

pub fn validate_tag_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("tag name must not be empty");
    }
    if name.chars().any(|c| FORBIDDEN_TAG_CHARS.contains(c) || c.is_whitespace()) {
        bail!("tag name {name:?} contains a forbidden character");
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagRequestWire {
    pub count: u32,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TagRequest {
    pub names: Vec<String>,
}

impl TagRequest {
    pub fn new(names: Vec<String>) -> Result<Self> {
        for n in &names {
            validate_tag_name(n)?;
        }
        Ok(Self { names })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let wire = TagRequestWire {
            count: self.names.len() as u32,
            tags: self.names.clone(),
        };
        write_len_prefixed_json(w, &wire, MAX_TAG_REQUEST_SIZE).await
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let wire: TagRequestWire =
            read_len_prefixed_json(r, MAX_TAG_REQUEST_SIZE).await?;
        if wire.tags.len() != wire.count as usize {
            bail!(
                "TagRequest count mismatch: header says {}, got {} names",
                wire.count,
                wire.tags.len()
            );
        }
        Ok(Self { names: wire.tags })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagResponseWire {
    pub count: u32,
    pub tags: HashMap<String, u16>,
}

/// A zero-`count` response is a refusal.
#[derive(Debug, Clone)]
pub struct TagResponse {
    pub remote_ids: HashMap<String, u16>,
}

impl TagResponse {
    pub fn refusal() -> Self {
        Self { remote_ids: HashMap::new() }
    }

    pub fn is_refusal(&self) -> bool {
        self.remote_ids.is_empty()
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let wire = TagResponseWire {
            count: self.remote_ids.len() as u32,
            tags: self.remote_ids.clone(),
        };
        write_len_prefixed_json(w, &wire, MAX_TAG_RESPONSE_SIZE).await
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let wire: TagResponseWire =
            read_len_prefixed_json(r, MAX_TAG_RESPONSE_SIZE).await?;
        Ok(Self { remote_ids: wire.tags })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_forbidden_characters() {
        assert!(validate_tag_name("syslog").is_ok());
        assert!(validate_tag_name("my-tag_01").is_ok());
        assert!(validate_tag_name("bad tag").is_err());
        assert!(validate_tag_name("bad;tag").is_err());
        assert!(validate_tag_name("").is_err());
    }

    #[tokio::test]
    async fn tag_request_round_trips() {
        let req = TagRequest::new(vec!["syslog".into(), "auth".into()]).unwrap();
        let mut buf = Vec::new();
        req.write(&mut buf).await.unwrap();
        let mut cur = std::io::Cursor::new(buf);
        let decoded = TagRequest::read(&mut cur).await.unwrap();
        assert_eq!(decoded.names, req.names);
    }

    #[tokio::test]
    async fn tag_response_refusal_round_trips() {
        let resp = TagResponse::refusal();
        let mut buf = Vec::new();
        resp.write(&mut buf).await.unwrap();
        let mut cur = std::io::Cursor::new(buf);
        let decoded = TagResponse::read(&mut cur).await.unwrap();
        assert!(decoded.is_refusal());
    }
}
