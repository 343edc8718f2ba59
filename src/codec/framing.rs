// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The two wire framings (§4.1): binary (`header|type|length|payload`) and
//! ASCII (`$HH HH <disc><encoded-payload>[*HH]<EOL>`), plus the
//! [`FrameScanner`] that pulls one complete frame's raw bytes out of a
//! streaming buffer without decoding it.
//!
//! A single [`decode_frame`]/[`encode_frame`] pair, parameterised by
//! [`Encoding`], replaces what would otherwise be six near-identical code
//! paths (Base64/Hex/CSV × with/without checksum, plus binary) — see §9
//! "Checksum and framing variants".

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::{
    codec::{
        error::{ErrorCode, ProtocolError},
        packet::{Direction, Packet, HEADER_BYTE, MAX_PAYLOAD_LEN},
    },
    templates::PayloadTemplate,
};

/// ASCII-framing encoding discriminator (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Binary,
    Base64,
    Hex,
    Csv,
}

impl Encoding {
    fn discriminator(self) -> Option<u8> {
        match self {
            Encoding::Binary => None,
            Encoding::Base64 => Some(b'='),
            Encoding::Hex => Some(b':'),
            Encoding::Csv => Some(b','),
        }
    }

    fn from_discriminator(b: u8) -> Option<Self> {
        match b {
            b'=' => Some(Encoding::Base64),
            b':' => Some(Encoding::Hex),
            b',' => Some(Encoding::Csv),
            _ => None,
        }
    }
}

/// Compute the ASCII-framing checksum: hex XOR of every byte from `$`
/// exclusive up to (but not including) `*` (§4.1, §6).
pub fn checksum_of(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

fn template_for(
    direction: Direction,
    raw_type: u8,
    lookup: &dyn Fn(Direction, u8) -> Option<PayloadTemplate>,
) -> Option<PayloadTemplate> {
    lookup(direction, raw_type)
}

// ---------------------------------------------------------------------
// Binary framing
// ---------------------------------------------------------------------

/// Decode one binary frame. `bytes` must be exactly the frame's bytes
/// (`3 + length_byte`); the caller (the [`FrameScanner`]) is responsible for
/// locating that boundary in a stream.
pub fn decode_binary(bytes: &[u8], direction: Direction) -> Result<Packet, ProtocolError> {
    if bytes.len() < 3 {
        return Err(ProtocolError::framing(ErrorCode::PacketLength, bytes.first().copied().unwrap_or(0)));
    }
    let header = bytes[0];
    if header != HEADER_BYTE {
        return Err(ProtocolError::framing(ErrorCode::PacketHeader, header));
    }
    let raw_type = bytes[1];
    let length = bytes[2] as usize;
    if bytes.len() != 3 + length {
        return Err(ProtocolError::new(ErrorCode::PacketLength, header, raw_type));
    }
    Ok(Packet {
        header,
        raw_type,
        direction,
        payload: bytes[3..].to_vec(),
    })
}

/// Encode a packet using the binary framing. The payload is assumed to
/// already respect the 253-byte cap (§3); longer payloads are truncated.
pub fn encode_binary(packet: &Packet) -> Vec<u8> {
    let len = packet.payload.len().min(MAX_PAYLOAD_LEN);
    let mut out = Vec::with_capacity(3 + len);
    out.push(packet.header);
    out.push(packet.raw_type);
    out.push(len as u8);
    out.extend_from_slice(&packet.payload[..len]);
    out
}

// ---------------------------------------------------------------------
// ASCII framing
// ---------------------------------------------------------------------

/// Decode one ASCII line (without its trailing EOL bytes) into a packet.
///
/// `template_lookup` resolves `(direction, raw_type) -> PayloadTemplate` for
/// CSV decoding; it is unused for the other encodings.
pub fn decode_ascii(
    line: &[u8],
    direction: Direction,
    template_lookup: &dyn Fn(Direction, u8) -> Option<PayloadTemplate>,
) -> Result<Packet, ProtocolError> {
    if line.first() != Some(&b'$') {
        return Err(ProtocolError::framing(ErrorCode::PacketLength, 0));
    }
    let body = &line[1..];

    // Strip an optional trailing "*HH" checksum.
    let (body, checksum_ok) = match body.iter().rposition(|&b| b == b'*') {
        Some(star) if body.len() - star == 3 => {
            let hex = std::str::from_utf8(&body[star + 1..]).ok();
            let expected = hex.and_then(|h| u8::from_str_radix(h, 16).ok());
            let actual = checksum_of(&body[..star]);
            (&body[..star], expected == Some(actual))
        },
        _ => (body, true),
    };

    if body.len() < 4 {
        return Err(ProtocolError::framing(ErrorCode::PacketLength, 0));
    }

    let header = parse_hex_byte(&body[0..2]).ok_or(ProtocolError::framing(ErrorCode::PacketLength, 0))?;
    if header != HEADER_BYTE {
        return Err(ProtocolError::framing(ErrorCode::PacketHeader, header));
    }
    let raw_type = parse_hex_byte(&body[2..4]).ok_or(ProtocolError::new(ErrorCode::PacketLength, header, 0))?;

    if !checksum_ok {
        return Err(ProtocolError::new(ErrorCode::PacketChecksum, header, raw_type));
    }

    let rest = &body[4..];
    let payload = if rest.is_empty() {
        Vec::new()
    } else {
        let disc = rest[0];
        let encoded = &rest[1..];
        match Encoding::from_discriminator(disc) {
            Some(Encoding::Base64) => BASE64
                .decode(encoded)
                .map_err(|_| ProtocolError::new(ErrorCode::PacketEncoding, header, raw_type))?,
            Some(Encoding::Hex) => decode_hex(encoded)
                .ok_or(ProtocolError::new(ErrorCode::PacketEncoding, header, raw_type))?,
            Some(Encoding::Csv) => {
                let template = template_for(direction, raw_type, template_lookup)
                    .ok_or(ProtocolError::new(ErrorCode::FormatNotRecognized, header, raw_type))?;
                template
                    .decode_csv(encoded)
                    .map_err(|_| ProtocolError::new(ErrorCode::PacketEncoding, header, raw_type))?
            },
            Some(Encoding::Binary) | None =>
                return Err(ProtocolError::new(ErrorCode::PacketEncoding, header, raw_type)),
        }
    };

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::new(ErrorCode::PacketLength, header, raw_type));
    }

    Ok(Packet { header, raw_type, direction, payload })
}

/// Encode a packet using the ASCII framing. When `Encoding::Csv` is
/// requested for a type with no registered template, falls back to Base64
/// (§4.1 "Encode").
pub fn encode_ascii(
    packet: &Packet,
    encoding: Encoding,
    with_checksum: bool,
    template_lookup: &dyn Fn(Direction, u8) -> Option<PayloadTemplate>,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(b'$');
    push_hex_byte(&mut body, packet.header);
    push_hex_byte(&mut body, packet.raw_type);

    if !packet.payload.is_empty() || encoding != Encoding::Binary {
        let actual_encoding = if encoding == Encoding::Csv
            && template_for(packet.direction, packet.raw_type, template_lookup).is_none()
        {
            Encoding::Base64
        } else {
            encoding
        };

        if let Some(disc) = actual_encoding.discriminator() {
            body.push(disc);
            match actual_encoding {
                Encoding::Base64 => body.extend_from_slice(BASE64.encode(&packet.payload).as_bytes()),
                Encoding::Hex => push_hex_bytes(&mut body, &packet.payload),
                Encoding::Csv => {
                    let template = template_for(packet.direction, packet.raw_type, template_lookup)
                        .expect("fell back to Base64 above when no template exists");
                    body.extend_from_slice(template.encode_csv(&packet.payload).as_bytes());
                },
                Encoding::Binary => unreachable!("binary has no ASCII discriminator"),
            }
        }
    }

    if with_checksum {
        let sum = checksum_of(&body[1..]);
        body.push(b'*');
        push_hex_byte(&mut body, sum);
    }

    body.extend_from_slice(b"\r\n");
    body
}

/// Decode the `content` byte range identified by [`FrameScanner::scan`],
/// dispatching to the binary or ASCII decoder by `kind`.
pub fn decode_frame(
    kind: FrameKind,
    content: &[u8],
    direction: Direction,
    template_lookup: &dyn Fn(Direction, u8) -> Option<PayloadTemplate>,
) -> Result<Packet, ProtocolError> {
    match kind {
        FrameKind::Binary => decode_binary(content, direction),
        FrameKind::Ascii => decode_ascii(content, direction, template_lookup),
    }
}

fn parse_hex_byte(digits: &[u8]) -> Option<u8> {
    if digits.len() != 2 {
        return None;
    }
    let s = std::str::from_utf8(digits).ok()?;
    u8::from_str_radix(s, 16).ok()
}

fn push_hex_byte(out: &mut Vec<u8>, b: u8) {
    out.extend_from_slice(format!("{b:02X}").as_bytes());
}

fn push_hex_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        push_hex_byte(out, b);
    }
}

fn decode_hex(digits: &[u8]) -> Option<Vec<u8>> {
    if digits.len() % 2 != 0 {
        return None;
    }
    let s = std::str::from_utf8(digits).ok()?;
    hex::decode(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::{TemplateDirection, TemplateRegistry};

    fn no_templates(_: Direction, _: u8) -> Option<PayloadTemplate> {
        None
    }

    fn static_lookup(direction: Direction, raw_type: u8) -> Option<PayloadTemplate> {
        TemplateRegistry::static_lookup(direction.into(), raw_type)
    }

    #[test]
    fn binary_round_trips_through_encode_and_decode() {
        let packet = Packet::client(0x11, vec![1, 2, 3, 4, 5, 6]);
        let bytes = encode_binary(&packet);
        assert_eq!(bytes, vec![HEADER_BYTE, 0x11, 6, 1, 2, 3, 4, 5, 6]);
        let decoded = decode_binary(&bytes, Direction::ClientToServer).expect("valid frame");
        assert_eq!(decoded.payload, packet.payload);
        assert_eq!(decoded.raw_type, packet.raw_type);
    }

    #[test]
    fn decode_binary_rejects_a_short_length_mismatch() {
        let bytes = vec![HEADER_BYTE, 0x11, 6, 1, 2];
        let err = decode_binary(&bytes, Direction::ClientToServer).unwrap_err();
        assert_eq!(err.code, ErrorCode::PacketLength);
    }

    #[test]
    fn decode_binary_rejects_an_unrecognized_header_byte() {
        let bytes = vec![0x00, 0x11, 0];
        let err = decode_binary(&bytes, Direction::ClientToServer).unwrap_err();
        assert_eq!(err.code, ErrorCode::PacketHeader);
    }

    #[test]
    fn ascii_hex_round_trips_without_checksum() {
        let packet = Packet::client(0x12, b"ABC123".to_vec());
        let line = encode_ascii(&packet, Encoding::Hex, false, &no_templates);
        assert!(line.ends_with(b"\r\n"));
        let decoded = decode_ascii(&line[..line.len() - 2], Direction::ClientToServer, &no_templates).expect("valid line");
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn ascii_base64_round_trips_with_checksum() {
        let packet = Packet::client(0x12, b"hello world".to_vec());
        let line = encode_ascii(&packet, Encoding::Base64, true, &no_templates);
        let decoded = decode_ascii(&line[..line.len() - 2], Direction::ClientToServer, &no_templates).expect("valid line");
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn ascii_decode_rejects_a_tampered_checksum() {
        let packet = Packet::client(0x12, b"hello".to_vec());
        let mut line = encode_ascii(&packet, Encoding::Base64, true, &no_templates);
        let star = line.iter().rposition(|&b| b == b'*').expect("checksum present");
        line[star + 1] ^= 0xFF;
        let err = decode_ascii(&line[..line.len() - 2], Direction::ClientToServer, &no_templates).unwrap_err();
        assert_eq!(err.code, ErrorCode::PacketChecksum);
    }

    #[test]
    fn ascii_csv_round_trips_using_the_static_template() {
        let payload = vec![0u8; 40];
        let packet = Packet::client(0x30, payload.clone());
        let line = encode_ascii(&packet, Encoding::Csv, false, &static_lookup);
        let decoded = decode_ascii(&line[..line.len() - 2], Direction::ClientToServer, &static_lookup).expect("valid line");
        assert_eq!(decoded.payload.len(), payload.len());
    }

    #[test]
    fn scanner_reports_incomplete_until_the_full_binary_frame_arrives() {
        let full = vec![HEADER_BYTE, 0x11, 2, 9, 9];
        assert!(matches!(FrameScanner::scan(&full[..2]), ScanOutcome::Incomplete));
        assert!(matches!(FrameScanner::scan(&full[..4]), ScanOutcome::Incomplete));
        match FrameScanner::scan(&full) {
            ScanOutcome::Frame { kind, content, consumed } => {
                assert_eq!(kind, FrameKind::Binary);
                assert_eq!(content, full.len());
                assert_eq!(consumed, full.len());
            },
            ScanOutcome::Incomplete => panic!("expected a complete frame, got Incomplete"),
            ScanOutcome::Garbage { .. } => panic!("expected a complete frame, got Garbage"),
        }
    }

    #[test]
    fn scanner_consumes_a_crlf_run_after_an_ascii_line() {
        let buf = b"$E011\r\n\r\nleftover".to_vec();
        match FrameScanner::scan(&buf) {
            ScanOutcome::Frame { kind, content, consumed } => {
                assert_eq!(kind, FrameKind::Ascii);
                assert_eq!(content, 5);
                assert_eq!(consumed, buf.len() - b"leftover".len());
            },
            ScanOutcome::Incomplete => panic!("expected a complete frame, got Incomplete"),
            ScanOutcome::Garbage { .. } => panic!("expected a complete frame, got Garbage"),
        }
    }

    #[test]
    fn scanner_reports_garbage_for_an_unrecognized_start_byte() {
        let buf = vec![0x41, HEADER_BYTE];
        assert!(matches!(FrameScanner::scan(&buf), ScanOutcome::Garbage { skip: 1 }));
    }
}

// ---------------------------------------------------------------------
// Frame scanner
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Binary,
    Ascii,
}

/// Outcome of attempting to pull one frame's raw bytes out of a buffer.
pub enum ScanOutcome {
    /// A complete frame was found. `content` is the byte range to hand to
    /// [`decode_binary`]/[`decode_ascii`] (for ASCII, the EOL is already
    /// stripped); `consumed` is the total number of leading bytes the
    /// caller must drop from its buffer, which for ASCII also swallows the
    /// EOL run.
    Frame { kind: FrameKind, content: usize, consumed: usize },
    /// Not enough bytes buffered yet to know the frame's length.
    Incomplete,
    /// The buffer does not start with a recognizable frame start byte; the
    /// caller should drop `skip` bytes and scan again.
    Garbage { skip: usize },
}

/// Scans a byte buffer for complete frames without decoding them, so the
/// transport layer knows exactly how many bytes to consume per read (§4.1
/// "Frame scanner").
pub struct FrameScanner;

impl FrameScanner {
    /// Looks at the start of `buf` and reports whether a full frame is
    /// present yet. Tolerates arbitrary interleaving of `\r`/`\n` and
    /// multiple trailing EOL bytes for ASCII frames.
    pub fn scan(buf: &[u8]) -> ScanOutcome {
        match buf.first() {
            None => ScanOutcome::Incomplete,
            Some(&HEADER_BYTE) => {
                if buf.len() < 3 {
                    return ScanOutcome::Incomplete;
                }
                let total = 3 + buf[2] as usize;
                if buf.len() < total {
                    ScanOutcome::Incomplete
                } else {
                    ScanOutcome::Frame { kind: FrameKind::Binary, content: total, consumed: total }
                }
            },
            Some(&b'$') => match buf.iter().position(|&b| b == b'\r' || b == b'\n') {
                Some(mut eol) => {
                    let content = eol;
                    // Swallow any run of \r/\n bytes (CRLF, LFCR, repeats).
                    while eol < buf.len() && (buf[eol] == b'\r' || buf[eol] == b'\n') {
                        eol += 1;
                    }
                    ScanOutcome::Frame { kind: FrameKind::Ascii, content, consumed: eol }
                },
                None => ScanOutcome::Incomplete,
            },
            Some(_) => ScanOutcome::Garbage { skip: 1 },
        }
    }
}
