// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::UdpConfig,
    codec::framing::FrameKind,
    persistence::Persistence,
    session::{self, SessionCtx, SessionIo},
    transport::take_frame,
};

/// `SessionIo` for one UDP flow, demultiplexed by source address (§4.3, §5).
/// Datagrams arrive over `rx`; replies go back out through the shared socket
/// addressed to `peer`, mirroring the teacher's single shared writer behind
/// per-ITT channels in `client/client.rs`.
struct UdpSessionIo {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    rx: mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
    max_packet_length: usize,
}

#[async_trait]
impl SessionIo for UdpSessionIo {
    async fn read_frame(&mut self) -> std::io::Result<Option<(FrameKind, Vec<u8>)>> {
        loop {
            if let Some(frame) = take_frame(&mut self.buf, self.max_packet_length)? {
                return Ok(Some(frame));
            }
            match self.rx.recv().await {
                Some(datagram) => self.buf.extend_from_slice(&datagram),
                None => return Ok(None),
            }
        }
    }

    async fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(bytes, self.peer).await.map(|_| ())
    }

    fn is_duplex(&self) -> bool {
        false
    }
}

/// Receives datagrams on one socket and fans them out to one session task per
/// source address (§4.3 "A UDP session increments only the 'total' profile").
/// Flows are removed from the map as soon as their session task finishes, so
/// the map never holds more entries than there are live sessions; a session's
/// own idle/session deadline (`SessionTimeouts`) is what actually bounds how
/// long an inactive flow is kept open.
pub async fn run(cfg: UdpConfig, persistence: Arc<dyn Persistence>, cancel: CancellationToken) -> Result<()> {
    let addr = cfg.socket_addr()?;
    let socket = Arc::new(UdpSocket::bind(addr).await.with_context(|| format!("binding udp socket on {addr}"))?);
    info!(%addr, "udp dispatcher listening");

    let flows: Arc<DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>> = Arc::new(DashMap::new());
    let mut recv_buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("udp dispatcher shutting down");
                return Ok(());
            },
            received = socket.recv_from(&mut recv_buf) => {
                let (n, peer) = received.context("receiving udp datagram")?;
                let datagram = recv_buf[..n].to_vec();

                let existing = flows.get(&peer).map(|entry| entry.value().clone());
                let sender = match existing {
                    Some(sender) => sender,
                    None => {
                        let (tx, rx) = mpsc::channel(64);
                        let io = Box::new(UdpSessionIo {
                            socket: Arc::clone(&socket),
                            peer,
                            rx,
                            buf: Vec::new(),
                            max_packet_length: cfg.max_packet_length,
                        });
                        let session_cancel = cancel.child_token();
                        let timeouts = cfg.session_timeouts();
                        let persistence = Arc::clone(&persistence);
                        let flows_for_task = Arc::clone(&flows);

                        flows.insert(peer, tx.clone());
                        tokio::spawn(async move {
                            let mut ctx = SessionCtx::new(io, persistence, session_cancel, timeouts);
                            info!(%peer, "udp session opened");
                            session::states::run(&mut ctx).await;
                            flows_for_task.remove(&peer);
                            info!(%peer, "udp session closed");
                        });
                        tx
                    },
                };

                if sender.send(datagram).await.is_err() {
                    warn!(%peer, "dropping datagram for a session that already closed");
                    flows.remove(&peer);
                }
            },
        }
    }
}
