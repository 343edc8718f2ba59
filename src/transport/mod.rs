// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection Acceptor (§2 item 6, §5): a TCP listener and a UDP dispatcher,
//! each handing an accepted flow to its own [`crate::session`] task exactly
//! as the teacher spawns one `read_loop` per [`crate::client::client::ClientConnection`].

pub mod tcp;
pub mod udp;

use crate::codec::framing::{FrameKind, FrameScanner, ScanOutcome};

/// Pulls whatever complete frames are already sitting in `buf`, growing it
/// via `buf.extend_from_slice` between calls. Shared by the TCP and UDP
/// `SessionIo` implementations, which differ only in how they fill `buf`.
pub(crate) fn take_frame(buf: &mut Vec<u8>, max_len: usize) -> std::io::Result<Option<(FrameKind, Vec<u8>)>> {
    loop {
        match FrameScanner::scan(buf) {
            ScanOutcome::Frame { kind, content, consumed } => {
                let out = buf[..content].to_vec();
                buf.drain(..consumed);
                return Ok(Some((kind, out)));
            },
            ScanOutcome::Garbage { skip } => {
                buf.drain(..skip);
            },
            ScanOutcome::Incomplete => {
                if buf.len() >= max_len {
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame exceeds configured max packet length"));
                }
                return Ok(None);
            },
        }
    }
}
