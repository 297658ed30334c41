// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result};
use ingest_mux::{
    cfg::{cli::resolve_config_path, config::MuxerConfig, logger::init_logger},
    entry::{Entry, SourceAddr},
    muxer::IngestMuxer,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logger("tests/config_logger.yaml")?;

    let cfg = resolve_config_path("config.ingest-mux.yaml")
        .and_then(MuxerConfig::load_from_file)
        .context("failed to resolve or load config")?;

    let muxer = IngestMuxer::new(cfg).await.context("building muxer")?;
    muxer.start().await.context("starting muxer")?;

    muxer.wait_for_hot(Duration::from_secs(30)).await.context("waiting for a hot connection")?;
    info!(hot = muxer.hot(), "at least one destination is up");

    let tag = muxer.get_tag("default").unwrap_or(0);
    for i in 0..10u8 {
        let entry = Entry::new(0, 0, tag, SourceAddr::unset_v4(), vec![i; 16]);
        muxer.write(entry).await.context("writing demo entry")?;
    }
    muxer.sync(Duration::from_secs(10)).await.context("syncing after demo writes")?;
    info!("wrote and synced 10 demo entries");

    muxer.close().await.context("closing muxer")?;
    Ok(())
}
