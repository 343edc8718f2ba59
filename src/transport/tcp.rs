// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{
    io::AsyncReadExt,
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::TcpConfig,
    codec::framing::FrameKind,
    persistence::Persistence,
    session::{self, SessionCtx, SessionIo},
    transport::take_frame,
};

/// `SessionIo` over a split `TcpStream` (§4.3, grounded on the teacher's
/// `ClientConnection` read/write-half split in `client/client.rs`).
struct TcpSessionIo {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    buf: Vec<u8>,
    max_packet_length: usize,
}

impl TcpSessionIo {
    fn new(reader: OwnedReadHalf, writer: OwnedWriteHalf, max_packet_length: usize) -> Self {
        Self { reader, writer, buf: Vec::new(), max_packet_length }
    }
}

#[async_trait]
impl SessionIo for TcpSessionIo {
    async fn read_frame(&mut self) -> std::io::Result<Option<(FrameKind, Vec<u8>)>> {
        loop {
            if let Some(frame) = take_frame(&mut self.buf, self.max_packet_length)? {
                return Ok(Some(frame));
            }
            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await
    }

    fn is_duplex(&self) -> bool {
        true
    }
}

/// Accepts TCP connections and spawns one session task per socket (§5
/// "Concurrency model"). Runs until `cancel` fires.
pub async fn run(cfg: TcpConfig, persistence: Arc<dyn Persistence>, cancel: CancellationToken) -> Result<()> {
    let addr = cfg.socket_addr()?;
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding tcp listener on {addr}"))?;
    info!(%addr, "tcp acceptor listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("tcp acceptor shutting down");
                return Ok(());
            },
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accepting tcp connection")?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(%peer, error = %e, "failed to set TCP_NODELAY");
                }
                if let Err(e) = stream.set_linger(Some(cfg.linger)) {
                    warn!(%peer, error = %e, "failed to set SO_LINGER");
                }
                let (reader, writer) = stream.into_split();
                let io = Box::new(TcpSessionIo::new(reader, writer, cfg.max_packet_length));
                let session_cancel = cancel.child_token();
                let timeouts = cfg.session_timeouts();
                let persistence = Arc::clone(&persistence);

                tokio::spawn(async move {
                    let mut ctx = SessionCtx::new(io, persistence, session_cancel, timeouts);
                    info!(%peer, "tcp session accepted");
                    session::states::run(&mut ctx).await;
                    info!(%peer, "tcp session closed");
                });
            },
        }
    }
}
