// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use telemetry_server_rs::{
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    persistence::{memory::MemoryStore, Persistence},
    transport,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _logger_guard = init_logger("config/logger.yaml")?;

    let cfg = resolve_config_path("config/telemetry-server.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let persistence: Arc<dyn Persistence> = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();

    let tcp = tokio::spawn(transport::tcp::run(cfg.transport.tcp.clone(), Arc::clone(&persistence), cancel.child_token()));
    let udp = tokio::spawn(transport::udp::run(cfg.transport.udp.clone(), Arc::clone(&persistence), cancel.child_token()));

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, stopping acceptors");
    cancel.cancel();

    let (tcp_res, udp_res) = tokio::join!(tcp, udp);
    tcp_res.context("tcp acceptor task panicked")??;
    udp_res.context("udp acceptor task panicked")??;

    Ok(())
}
