// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::VecDeque;

use async_trait::async_trait;
use telemetry_server_rs::{
    codec::{framing::{encode_binary, FrameKind}, geo::GeoPoint, packet::Packet},
    domain::{Account, Device, EncodingSet},
    persistence::memory::MemoryStore,
    rate::RateProfile,
    session::{states, SessionCtx, SessionIo, SessionTimeouts},
};
use tokio_util::sync::CancellationToken;

/// A `SessionIo` that replays a scripted sequence of already-framed inbound
/// bytes and records everything the session writes back, standing in for a
/// real socket the way the teacher lineage's tests stand in for a PDU
/// connection with fixture bytes.
struct ScriptedIo {
    inbound: VecDeque<(FrameKind, Vec<u8>)>,
    written: Vec<Vec<u8>>,
}

#[async_trait]
impl SessionIo for ScriptedIo {
    async fn read_frame(&mut self) -> std::io::Result<Option<(FrameKind, Vec<u8>)>> {
        Ok(self.inbound.pop_front())
    }

    async fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.written.push(bytes.to_vec());
        Ok(())
    }

    fn is_duplex(&self) -> bool {
        true
    }
}

fn sample_device() -> (Account, Device) {
    let account = Account { account_id: "acct-1".into(), description: String::new(), is_active: true, password_hash: String::new() };
    let device = Device {
        account_id: "acct-1".into(),
        device_id: "dev-1".into(),
        unique_id: 0x0000_0000_1234,
        description: String::new(),
        is_active: true,
        supported_encodings: EncodingSet::BINARY | EncodingSet::CSV,
        unit_limit_interval_minutes: 60,
        max_allowed_events: 1000,
        total_max_conn: 10,
        total_max_conn_per_min: 10,
        last_total_connect_time: 0,
        total_profile_mask: RateProfile::new(60),
        duplex_max_conn: 10,
        duplex_max_conn_per_min: 10,
        last_duplex_connect_time: 0,
        duplex_profile_mask: RateProfile::new(60),
        motion_streak: false,
    };
    (account, device)
}

fn fixed_std_event_payload() -> Vec<u8> {
    let mut payload = Vec::with_capacity(23);
    payload.extend_from_slice(&1_700_000_000u32.to_be_bytes()); // timestamp
    payload.extend_from_slice(&0u16.to_be_bytes()); // status code
    payload.extend_from_slice(&GeoPoint::new(41.0082, 28.9784).encode6()); // gps
    payload.push(60); // speed
    payload.push(180); // heading
    payload.extend_from_slice(&100u16.to_be_bytes()); // altitude
    payload.extend_from_slice(&[0, 1, 0]); // odometer (24-bit)
    payload.push(0); // top speed
    payload.push(0); // geofence 0
    payload.push(0); // geofence 1
    payload.push(7); // sequence
    payload
}

#[tokio::test]
async fn unique_id_identification_followed_by_an_event_persists_it() {
    let store = MemoryStore::new();
    let (account, device) = sample_device();
    store.insert_account(account);
    store.insert_device(device.clone());

    let unique_id_frame = encode_binary(&Packet::client(0x11, device.unique_id.to_be_bytes()[2..].to_vec()));
    let event_frame = encode_binary(&Packet::client(0x30, fixed_std_event_payload()));

    let io = Box::new(ScriptedIo {
        inbound: VecDeque::from([(FrameKind::Binary, unique_id_frame), (FrameKind::Binary, event_frame)]),
        written: Vec::new(),
    });

    let mut ctx = SessionCtx::new(io, std::sync::Arc::new(store), CancellationToken::new(), SessionTimeouts::tcp_defaults());
    states::run(&mut ctx).await;

    assert_eq!(ctx.account_id(), "acct-1");
    assert_eq!(ctx.device_id(), "dev-1");
    assert_eq!(ctx.stats.events_persisted, 1);
    assert_eq!(ctx.stats.events_rejected, 0);
}

#[tokio::test]
async fn an_event_with_an_invalid_gps_fix_is_rejected_not_persisted() {
    let store = MemoryStore::new();
    let (account, device) = sample_device();
    store.insert_account(account);
    store.insert_device(device.clone());

    let unique_id_frame = encode_binary(&Packet::client(0x11, device.unique_id.to_be_bytes()[2..].to_vec()));
    let mut bad_payload = fixed_std_event_payload();
    bad_payload[4..10].copy_from_slice(&GeoPoint::new(0.0, 0.0).encode6());
    let event_frame = encode_binary(&Packet::client(0x30, bad_payload));

    let io = Box::new(ScriptedIo {
        inbound: VecDeque::from([(FrameKind::Binary, unique_id_frame), (FrameKind::Binary, event_frame)]),
        written: Vec::new(),
    });

    let mut ctx = SessionCtx::new(io, std::sync::Arc::new(store), CancellationToken::new(), SessionTimeouts::tcp_defaults());
    states::run(&mut ctx).await;

    assert_eq!(ctx.stats.events_persisted, 0);
    assert_eq!(ctx.stats.events_rejected, 1);
}

#[tokio::test]
async fn an_unrecognized_identity_frame_closes_the_session_without_identifying() {
    let store = MemoryStore::new();
    let garbage_frame = encode_binary(&Packet::client(0x30, vec![0u8; 23]));

    let io = Box::new(ScriptedIo { inbound: VecDeque::from([(FrameKind::Binary, garbage_frame)]), written: Vec::new() });
    let mut ctx = SessionCtx::new(io, std::sync::Arc::new(store), CancellationToken::new(), SessionTimeouts::tcp_defaults());
    states::run(&mut ctx).await;

    assert!(ctx.account.is_none());
    assert!(ctx.device.is_none());
}
