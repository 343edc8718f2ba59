// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use telemetry_server_rs::{
    cfg::config::TcpConfig,
    codec::{framing::encode_binary, geo::GeoPoint, packet::Packet},
    domain::{Account, Device, EncodingSet},
    persistence::{memory::MemoryStore, Persistence},
    rate::RateProfile,
    transport,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

fn sample_device() -> (Account, Device) {
    let account = Account { account_id: "acct-1".into(), description: String::new(), is_active: true, password_hash: String::new() };
    let device = Device {
        account_id: "acct-1".into(),
        device_id: "dev-1".into(),
        unique_id: 0x0000_0000_4242,
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

/// Identifies over a raw TCP socket and sends one fixed-standard event,
/// exercising the acceptor (`transport::tcp::run`), the session state
/// machine and the in-memory persistence adapter together, the way the
/// teacher lineage's `login_plain_ok`/`read_write_read` tests drive the
/// whole client stack against a real socket instead of mocking it.
#[tokio::test]
async fn identifies_and_persists_an_event_over_a_real_socket() {
    let store = Arc::new(MemoryStore::new());
    let (account, device) = sample_device();
    store.insert_account(account);
    store.insert_device(device.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let cfg = TcpConfig {
        listen_addr: addr.to_string(),
        max_packet_length: 600,
        idle_timeout: Duration::from_secs(4),
        packet_timeout: Duration::from_secs(1),
        session_timeout: Duration::from_secs(5),
        linger: Duration::from_secs(1),
    };

    let cancel = CancellationToken::new();
    let acceptor_cancel = cancel.child_token();
    let persistence: Arc<dyn Persistence> = store.clone();
    let acceptor = tokio::spawn(transport::tcp::run(cfg, persistence, acceptor_cancel));

    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut socket = TcpStream::connect(addr).await.expect("connect to acceptor");

    let unique_id_bytes = device.unique_id.to_be_bytes()[2..].to_vec();
    socket.write_all(&encode_binary(&Packet::client(0x11, unique_id_bytes))).await.expect("send unique id");

    let mut event_payload = Vec::with_capacity(23);
    event_payload.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    event_payload.extend_from_slice(&0u16.to_be_bytes());
    event_payload.extend_from_slice(&GeoPoint::new(41.0082, 28.9784).encode6());
    event_payload.extend_from_slice(&[60, 180, 0, 100, 0, 1, 0, 0, 0, 0, 7]);
    socket.write_all(&encode_binary(&Packet::client(0x30, event_payload))).await.expect("send event");

    socket.write_all(&encode_binary(&Packet::client(0x00, Vec::new()))).await.expect("send eob done");

    let mut reply = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut reply)).await.expect("reply within timeout").expect("read reply");
    assert!(n > 0, "server should reply to EOB_DONE with at least an ACK");

    drop(socket);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = store.events_snapshot();
    assert_eq!(events.len(), 1, "exactly one event should have been persisted");

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), acceptor).await;
}
