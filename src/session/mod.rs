// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session State Machine (§4.3): one instance per accepted TCP connection or
//! UDP flow, consuming framed packets from the transport and driving the
//! `AWAITING_IDENTITY → IDENTIFIED → ACTIVE → CLOSING → CLOSED` dialog.

pub mod outbound;
pub mod states;

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    codec::{
        error::ProtocolError,
        framing::{Encoding, FrameKind},
        packet::{Direction, Packet},
    },
    domain::{Account, Device, SessionStats},
    persistence::Persistence,
    templates::PayloadTemplate,
};

/// Transport-agnostic I/O the session drives. TCP and UDP acceptors each
/// provide their own implementation (`crate::transport`); the session only
/// ever sees this trait.
#[async_trait]
pub trait SessionIo: Send {
    /// Waits for and returns one complete frame's raw content bytes and its
    /// [`FrameKind`], or `Ok(None)` on clean EOF.
    async fn read_frame(&mut self) -> std::io::Result<Option<(FrameKind, Vec<u8>)>>;

    async fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// `true` for TCP (duplex), `false` for UDP (one-shot datagram flow).
    fn is_duplex(&self) -> bool;
}

/// Race an I/O future against both the cancellation token and a deadline,
/// the same shape as the teacher connection's `io_with_timeout` helper.
pub async fn io_with_timeout<F, T>(label: &'static str, fut: F, timeout: Duration, cancel: &CancellationToken) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("{label} cancelled")),
        res = tokio::time::timeout(timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow!("{label} timed out")),
            }
        }
    }
}

/// Per-session configurable timeouts (§4.3, §6 "Transport configuration").
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub idle: Duration,
    pub packet_assembly: Duration,
    pub session: Duration,
}

impl SessionTimeouts {
    pub const fn tcp_defaults() -> Self {
        Self { idle: Duration::from_secs(4), packet_assembly: Duration::from_secs(1), session: Duration::from_secs(5) }
    }

    pub const fn udp_defaults() -> Self {
        Self { idle: Duration::from_secs(4), packet_assembly: Duration::from_secs(1), session: Duration::from_secs(60) }
    }
}

/// Which wire framing (and, for ASCII, which discriminator/checksum habit)
/// the session has locked to after its first received frame (§4.3 "Encoding
/// negotiation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireLock {
    Binary,
    Ascii { checksum: bool },
}

/// Mutable state threaded through every state's `step` (the `Ctx` half of
/// the teacher's `StateMachine<Ctx, RespCtx>` split).
pub struct SessionCtx {
    pub io: Box<dyn SessionIo>,
    pub persistence: Arc<dyn Persistence>,
    pub cancel: CancellationToken,
    pub timeouts: SessionTimeouts,
    pub max_events_before_quota: u32,

    pub account: Option<Account>,
    pub device: Option<Device>,
    pub pending_account_id: Option<String>,
    /// Set once admission (§4.5) accepts the session. Gates
    /// [`SessionCtx::flush_session_stats`]: a session rejected before
    /// acceptance must leave `lastConnectTime`/the rate profile untouched
    /// (§8 scenario 3).
    pub accepted: bool,

    pub wire_lock: Option<WireLock>,
    pub session_templates: HashMap<u8, PayloadTemplate>,

    pub stats: SessionStats,
    pub last_sequence_seen: u32,
    pub pending_error: Option<ProtocolError>,
    pub closed_cleanly: bool,
    pub deadline: tokio::time::Instant,
}

impl SessionCtx {
    pub fn new(io: Box<dyn SessionIo>, persistence: Arc<dyn Persistence>, cancel: CancellationToken, timeouts: SessionTimeouts) -> Self {
        let deadline = tokio::time::Instant::now() + timeouts.session;
        Self {
            io,
            persistence,
            cancel,
            timeouts,
            deadline,
            max_events_before_quota: u32::MAX,
            account: None,
            device: None,
            pending_account_id: None,
            accepted: false,
            wire_lock: None,
            session_templates: HashMap::new(),
            stats: SessionStats::default(),
            last_sequence_seen: 0,
            pending_error: None,
            closed_cleanly: false,
        }
    }

    pub fn account_id(&self) -> &str {
        self.account.as_ref().map(|a| a.account_id.as_str()).unwrap_or_default()
    }

    pub fn device_id(&self) -> &str {
        self.device.as_ref().map(|d| d.device_id.as_str()).unwrap_or_default()
    }

    /// Locks the wire encoding on the first frame received this session; a
    /// later frame of the other kind is a `BAD_ENCODING` mismatch (§4.3).
    pub fn observe_wire_kind(&mut self, kind: FrameKind, checksummed: bool) -> bool {
        let observed = match kind {
            FrameKind::Binary => WireLock::Binary,
            FrameKind::Ascii => WireLock::Ascii { checksum: checksummed },
        };
        match self.wire_lock {
            None => {
                self.wire_lock = Some(observed);
                true
            },
            Some(locked) => std::mem::discriminant(&locked) == std::mem::discriminant(&observed),
        }
    }

    /// Serializes and writes one server→client packet using the session's
    /// locked wire encoding (binary until locked, since nothing has been
    /// received yet is only possible before any reply is due).
    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        let lookup = |direction: Direction, raw_type: u8| {
            crate::templates::TemplateRegistry::resolve(direction.into(), raw_type, &self.session_templates, None)
        };
        let bytes = match self.wire_lock {
            None | Some(WireLock::Binary) => crate::codec::framing::encode_binary(&packet),
            Some(WireLock::Ascii { checksum }) => crate::codec::framing::encode_ascii(&packet, Encoding::Csv, checksum, &lookup),
        };
        io_with_timeout("session write", self.io.write_frame(&bytes), self.timeouts.packet_assembly, &self.cancel).await?;
        Ok(())
    }

    /// Persists the rate-profile state exactly once (§5 "Cancellation" (c)).
    /// A session that never reached `accepted` (rejected during admission,
    /// §4.5) has nothing to flush: `lastConnectTime` and the rate profile
    /// must stay exactly as they were before this session was admitted (§8
    /// scenario 3).
    pub async fn flush_session_stats(&mut self) -> Result<()> {
        if self.closed_cleanly || !self.accepted {
            return Ok(());
        }
        if let Some(device) = &self.device {
            if let Err(e) = self
                .persistence
                .update_device_session_stats(
                    &device.account_id,
                    &device.device_id,
                    device.total_profile_mask.clone(),
                    device.last_total_connect_time,
                    device.duplex_profile_mask.clone(),
                    device.last_duplex_connect_time,
                )
                .await
            {
                warn!(error = %e, "failed to flush session stats");
            }
        }
        self.closed_cleanly = true;
        Ok(())
    }
}
