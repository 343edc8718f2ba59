// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire codec: packet shape, the two framings, GPS point encoding and the
//! payload cursor (§3, §4.1, §6).

pub mod error;
pub mod framing;
pub mod geo;
pub mod packet;
pub mod payload;

pub use error::{ErrorCode, ProtocolError};
pub use framing::{checksum_of, decode_ascii, decode_binary, decode_frame, encode_ascii, encode_binary, Encoding, FrameKind, FrameScanner, ScanOutcome};
pub use geo::GeoPoint;
pub use packet::{ClientType, Direction, Packet, ServerType, HEADER_BYTE, MAX_PAYLOAD_LEN};
pub use payload::Payload;
