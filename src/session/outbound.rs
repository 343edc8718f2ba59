// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server→client packet builders (§4.6), one per outbound type, mirroring
//! the per-PDU `XxxRequestBuilder` shape the codec layer uses elsewhere in
//! this crate's lineage.

use crate::codec::{
    error::{ErrorCode, ProtocolError},
    packet::{Packet, ServerType},
    payload::Payload,
};

pub struct AckBuilder {
    last_sequence: u32,
}

impl AckBuilder {
    pub const fn new(last_sequence: u32) -> Self {
        Self { last_sequence }
    }

    pub fn build(self) -> Packet {
        let mut payload = Payload::new();
        payload.write_uint(u64::from(self.last_sequence), 4);
        Packet::server(ServerType::Ack.to_byte(), payload.into_bytes())
    }
}

pub struct EobBuilder {
    speak_freely: bool,
}

impl EobBuilder {
    pub const fn done() -> Self {
        Self { speak_freely: false }
    }

    pub const fn speak_freely() -> Self {
        Self { speak_freely: true }
    }

    pub fn build(self) -> Packet {
        let ty = if self.speak_freely { ServerType::EobSpeakFreely } else { ServerType::EobDone };
        Packet::server(ty.to_byte(), Vec::new())
    }
}

pub struct GetPropertyBuilder {
    key: u32,
}

impl GetPropertyBuilder {
    pub const fn new(key: u32) -> Self {
        Self { key }
    }

    pub fn build(self) -> Packet {
        let mut payload = Payload::new();
        payload.write_uint(u64::from(self.key), 4);
        Packet::server(ServerType::GetProperty.to_byte(), payload.into_bytes())
    }
}

pub struct SetPropertyBuilder {
    key: u16,
    value: Vec<u8>,
}

impl SetPropertyBuilder {
    pub const fn new(key: u16, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    pub fn build(self) -> Packet {
        let mut payload = Payload::new();
        payload.write_uint(u64::from(self.key), 2);
        payload.write_blob(&self.value);
        Packet::server(ServerType::SetProperty.to_byte(), payload.into_bytes())
    }
}

pub struct FileUploadBuilder {
    kind: u8,
    offset: u32,
    bytes: Vec<u8>,
}

impl FileUploadBuilder {
    pub const fn new(kind: u8, offset: u32, bytes: Vec<u8>) -> Self {
        Self { kind, offset, bytes }
    }

    pub fn build(self) -> Packet {
        let mut payload = Payload::new();
        payload.write_uint(u64::from(self.kind), 1);
        payload.write_uint(u64::from(self.offset), 3);
        payload.write_blob(&self.bytes);
        Packet::server(ServerType::FileUpload.to_byte(), payload.into_bytes())
    }
}

pub struct ErrorBuilder {
    code: ErrorCode,
    causing_header: u8,
    causing_type: u8,
    extra: Vec<u8>,
}

impl ErrorBuilder {
    pub const fn new(code: ErrorCode, causing_header: u8, causing_type: u8) -> Self {
        Self { code, causing_header, causing_type, extra: Vec::new() }
    }

    pub fn from_protocol_error(err: ProtocolError) -> Self {
        Self::new(err.code, err.header, err.ty)
    }

    pub fn with_extra(mut self, extra: Vec<u8>) -> Self {
        self.extra = extra;
        self
    }

    pub fn build(self) -> Packet {
        let mut payload = Payload::new();
        payload.write_uint(u64::from(self.code.as_u16()), 2);
        payload.write_uint(u64::from(self.causing_header), 1);
        payload.write_uint(u64::from(self.causing_type), 1);
        payload.write_blob(&self.extra);
        Packet::server(ServerType::Error.to_byte(), payload.into_bytes())
    }
}

pub struct EotBuilder;

impl EotBuilder {
    pub fn build(self) -> Packet {
        Packet::server(ServerType::Eot.to_byte(), Vec::new())
    }
}
