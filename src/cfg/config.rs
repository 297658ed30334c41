// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{CacheMode, ConnType};

/// Top-level configuration for an [`crate::muxer::IngestMuxer`].
///
/// Grouped by logical domain: destinations, caching, rate limiting,
/// identity, and the handful of runtime knobs the wire protocol exposes.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MuxerConfig {
    /// Peer indexers to fan entries out to.
    #[serde(rename = "Destinations")]
    pub destinations: Vec<DestinationConfig>,

    /// Spill-to-disk FIFO behaviour.
    #[serde(rename = "Cache", default)]
    pub cache: CacheConfig,

    /// Process-global token bucket, shared across every connection.
    #[serde(rename = "RateLimit", default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Metadata surfaced to indexers in periodic state pushes.
    #[serde(rename = "Ingester")]
    pub ingester: IngesterIdentity,

    /// Capacity of each connection's confirmation window.
    #[serde(rename = "MaxUnconfirmed", default = "default_max_unconfirmed")]
    pub max_unconfirmed: usize,

    /// How long the ack reader waits before flushing a partial batch of acks.
    #[serde(rename = "AckFlushIntervalMs", default = "default_ack_flush_ms")]
    pub ack_flush_interval_ms: u64,

    /// Idle read timeout per connection.
    #[serde(rename = "ConnectionTimeoutSecs", default = "default_conn_timeout")]
    pub connection_timeout_secs: u64,

    /// Bound on the emergency queue (entries orphaned by a dying connection).
    #[serde(rename = "EmergencyQueueCapacity", default = "default_emergency_cap")]
    pub emergency_queue_capacity: usize,
}

fn default_max_unconfirmed() -> usize {
    128
}

fn default_ack_flush_ms() -> u64 {
    10
}

fn default_conn_timeout() -> u64 {
    600
}

fn default_emergency_cap() -> usize {
    128
}

/// One indexer to ship entries to.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DestinationConfig {
    /// `tcp://host:port`, `tls://host:port`, or `pipe:///path/to/socket`.
    #[serde(rename = "Address")]
    pub address: String,

    /// Shared secret used to derive the CHAP-like auth hash. Absent means
    /// the peer accepts unauthenticated connections.
    #[serde(rename = "Secret", default)]
    pub secret: Option<String>,

    /// Optional tenant label forwarded during tag negotiation.
    #[serde(rename = "Tenant", default)]
    pub tenant: Option<String>,

    /// TLS parameters; required when the address scheme is `tls://`.
    #[serde(rename = "Tls", default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TlsConfig {
    #[serde(rename = "ClientCertPath", default)]
    pub client_cert_path: Option<String>,
    #[serde(rename = "ClientKeyPath", default)]
    pub client_key_path: Option<String>,
    #[serde(rename = "VerifyServer", default = "default_true")]
    pub verify_server: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CacheConfig {
    #[serde(rename = "Mode", default)]
    pub mode: CacheMode,
    #[serde(rename = "Path", default)]
    pub path: Option<String>,
    #[serde(rename = "MaxSizeMb", default = "default_cache_size")]
    pub max_size_mb: u64,
}

fn default_cache_size() -> u64 {
    64
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::default(),
            path: None,
            max_size_mb: default_cache_size(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RateLimitConfig {
    #[serde(rename = "BytesPerSecond")]
    pub bytes_per_second: u64,
    #[serde(rename = "Burst")]
    pub burst: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IngesterIdentity {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "Uuid", default)]
    pub uuid: Option<String>,
    #[serde(rename = "Label", default)]
    pub label: String,
}

impl MuxerConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: MuxerConfig =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.destinations.is_empty(), "at least one Destination is required");
        for dest in &self.destinations {
            let (conn_type, _) = parse_destination_address(&dest.address)?;
            if conn_type == ConnType::Tls {
                ensure!(
                    dest.tls.is_some(),
                    "destination {} uses tls:// but has no [Tls] section",
                    dest.address
                );
            }
        }
        ensure!(self.max_unconfirmed >= 1, "MaxUnconfirmed must be >= 1");
        ensure!(!self.ingester.name.is_empty(), "Ingester.Name must not be empty");
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn ack_flush_interval(&self) -> Duration {
        Duration::from_millis(self.ack_flush_interval_ms)
    }
}

/// Splits a destination address into its connection type and `host:port` (or
/// filesystem path, for `pipe://`) remainder.
pub fn parse_destination_address(addr: &str) -> Result<(ConnType, String)> {
    if let Some(rest) = addr.strip_prefix("tcp://") {
        ensure!(!rest.is_empty(), "malformed destination: {addr}");
        Ok((ConnType::Tcp, rest.to_string()))
    } else if let Some(rest) = addr.strip_prefix("tls://") {
        ensure!(!rest.is_empty(), "malformed destination: {addr}");
        Ok((ConnType::Tls, rest.to_string()))
    } else if let Some(rest) = addr.strip_prefix("pipe://") {
        ensure!(!rest.is_empty(), "malformed destination: {addr}");
        Ok((ConnType::Pipe, rest.to_string()))
    } else {
        anyhow::bail!("malformed destination (unknown scheme): {addr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schemes() {
        assert_eq!(
            parse_destination_address("tcp://127.0.0.1:4023").unwrap(),
            (ConnType::Tcp, "127.0.0.1:4023".to_string())
        );
        assert_eq!(
            parse_destination_address("tls://idx.example.com:4024").unwrap(),
            (ConnType::Tls, "idx.example.com:4024".to_string())
        );
        assert_eq!(
            parse_destination_address("pipe:///tmp/gw.sock").unwrap(),
            (ConnType::Pipe, "/tmp/gw.sock".to_string())
        );
        assert!(parse_destination_address("udp://127.0.0.1:1").is_err());
        assert!(parse_destination_address("tcp://").is_err());
    }
}
