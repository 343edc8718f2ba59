// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The five session states and the loop that drives them (§4.3). Each state
//! is a unit struct with a `step` function returning a [`Transition`],
//! mirroring the teacher lineage's `Transition<S, R>` / per-state-struct
//! shape, simplified from its generic `StateMachine<Ctx, RespCtx>` trait
//! (with its per-call boxed-future associated type) since this session loop
//! has one concrete context and no PDU-generic reuse to justify it.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::{
    codec::{
        error::ErrorCode,
        framing::{decode_frame, FrameKind},
        geo::GeoPoint,
        packet::{ClientType, Direction, Packet},
        payload::Payload,
    },
    domain::{AttributeKey, AttributeValue, DataSource, GeoEvent, InsertOutcome},
    identity::{resolve_by_account_device, resolve_by_unique_id},
    rate,
    session::{
        io_with_timeout,
        outbound::{AckBuilder, EobBuilder, ErrorBuilder, EotBuilder},
        SessionCtx,
    },
    templates::{FieldSemantic, PayloadTemplate, TemplateRegistry},
};

/// Mirrors the teacher lineage's `Transition<S, R>` exactly; `R` here is
/// always `()` since every step reports failure by mutating `ctx` instead.
pub enum Transition<S, R> {
    Next(S, R),
    Stay(R),
    Done(R),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingIdentity,
    Identified,
    Active,
    Closing,
    Closed,
}

/// Drives `ctx` through the state machine until it reaches `CLOSED`.
pub async fn run(ctx: &mut SessionCtx) {
    let mut phase = SessionPhase::AwaitingIdentity;
    loop {
        let transition = match phase {
            SessionPhase::AwaitingIdentity => step_awaiting_identity(ctx).await,
            SessionPhase::Identified => step_identified(ctx).await,
            SessionPhase::Active => step_active(ctx).await,
            SessionPhase::Closing => step_closing(ctx).await,
            SessionPhase::Closed => break,
        };
        match transition {
            Transition::Next(next, ()) => phase = next,
            Transition::Stay(()) => {},
            Transition::Done(()) => break,
        }
    }
}

enum FrameOutcome {
    Packet(Packet),
    Error(crate::codec::error::ProtocolError),
    TimedOut,
    Eof,
}

async fn next_frame(ctx: &mut SessionCtx) -> FrameOutcome {
    if tokio::time::Instant::now() >= ctx.deadline {
        return FrameOutcome::TimedOut;
    }
    let read = io_with_timeout("session read", ctx.io.read_frame(), ctx.timeouts.idle, &ctx.cancel).await;
    let Ok(frame) = read else {
        return FrameOutcome::TimedOut;
    };
    let Some((kind, content)) = frame else {
        return FrameOutcome::Eof;
    };

    let checksummed = kind == FrameKind::Ascii && content.len() >= 3 && content[content.len() - 3] == b'*';
    if !ctx.observe_wire_kind(kind, checksummed) {
        return FrameOutcome::Error(crate::codec::error::ProtocolError::framing(ErrorCode::PacketEncoding, crate::codec::packet::HEADER_BYTE));
    }

    let lookup = |direction: Direction, raw_type: u8| TemplateRegistry::resolve(direction.into(), raw_type, &ctx.session_templates, None);
    match decode_frame(kind, &content, Direction::ClientToServer, &lookup) {
        Ok(packet) => FrameOutcome::Packet(packet),
        Err(e) => FrameOutcome::Error(e),
    }
}

/// Lazily pulls a device-stored custom template into the session cache so
/// the (synchronous) decode closure can see it (§4.2 tier 2).
async fn ensure_custom_template_cached(ctx: &mut SessionCtx, raw_type: u8) {
    if ctx.session_templates.contains_key(&raw_type) {
        return;
    }
    let (Some(account), Some(device)) = (&ctx.account, &ctx.device) else { return };
    if let Ok(Some(template)) = ctx.persistence.load_custom_template(&account.account_id, &device.device_id, raw_type).await {
        ctx.session_templates.insert(raw_type, template);
    }
}

async fn emit_error_and_close(ctx: &mut SessionCtx, code: ErrorCode, header: u8, ty: u8) {
    let err = ErrorBuilder::new(code, header, ty).build();
    if let Err(e) = ctx.send(err).await {
        warn!(error = %e, "failed to send ERROR before closing");
    }
    if let Err(e) = ctx.send(EotBuilder.build()).await {
        warn!(error = %e, "failed to send EOT before closing");
    }
}

async fn step_awaiting_identity(ctx: &mut SessionCtx) -> Transition<SessionPhase, ()> {
    match next_frame(ctx).await {
        FrameOutcome::Eof | FrameOutcome::TimedOut => Transition::Next(SessionPhase::Closing, ()),
        FrameOutcome::Error(err) => {
            emit_error_and_close(ctx, err.code, err.header, err.ty).await;
            Transition::Next(SessionPhase::Closing, ())
        },
        FrameOutcome::Packet(packet) => match packet.client_type() {
            ClientType::UniqueId => {
                let value = Payload::from_bytes(packet.payload.clone()).read_uint(6);
                match resolve_by_unique_id(&*ctx.persistence, value).await {
                    Ok((account, device)) => {
                        ctx.account = Some(account);
                        ctx.device = Some(device);
                        Transition::Next(SessionPhase::Identified, ())
                    },
                    Err(e) => {
                        emit_error_and_close(ctx, e.error_code(), packet.header, packet.raw_type).await;
                        Transition::Next(SessionPhase::Closing, ())
                    },
                }
            },
            ClientType::AccountId => {
                ctx.pending_account_id = Some(String::from_utf8_lossy(&packet.payload).trim().to_owned());
                Transition::Stay(())
            },
            ClientType::DeviceId => {
                let Some(account_id) = ctx.pending_account_id.clone() else {
                    emit_error_and_close(ctx, ErrorCode::IdExpected, packet.header, packet.raw_type).await;
                    return Transition::Next(SessionPhase::Closing, ());
                };
                let device_id = String::from_utf8_lossy(&packet.payload).trim().to_owned();
                match resolve_by_account_device(&*ctx.persistence, &account_id, &device_id).await {
                    Ok((account, device)) => {
                        ctx.account = Some(account);
                        ctx.device = Some(device);
                        Transition::Next(SessionPhase::Identified, ())
                    },
                    Err(e) => {
                        emit_error_and_close(ctx, e.error_code(), packet.header, packet.raw_type).await;
                        Transition::Next(SessionPhase::Closing, ())
                    },
                }
            },
            _ => {
                emit_error_and_close(ctx, ErrorCode::IdExpected, packet.header, packet.raw_type).await;
                Transition::Next(SessionPhase::Closing, ())
            },
        },
    }
}

/// Admits the session per §4.5 and moves straight into `ACTIVE`; `IDENTIFIED`
/// is a transient phase rather than one that waits for another frame.
async fn step_identified(ctx: &mut SessionCtx) -> Transition<SessionPhase, ()> {
    let Some(device) = ctx.device.clone() else {
        return Transition::Next(SessionPhase::Closing, ());
    };
    let now = chrono::Utc::now().timestamp();
    let interval_enabled = device.unit_limit_interval_minutes > 0;

    // Admission runs against copies of the stored profile/connect-time; §4.5
    // only writes them back "otherwise accept", so nothing on `ctx.device` is
    // mutated until the result is known to be an accept (§8 scenario 3).
    let mut total_profile = device.total_profile_mask.clone();
    let total_result = rate::admit(&mut total_profile, now, device.last_total_connect_time, interval_enabled, device.total_max_conn, device.total_max_conn_per_min);

    let duplex_result = if ctx.io.is_duplex() {
        let mut duplex_profile = device.duplex_profile_mask.clone();
        Some((rate::admit(&mut duplex_profile, now, device.last_duplex_connect_time, interval_enabled, device.duplex_max_conn, device.duplex_max_conn_per_min), duplex_profile))
    } else {
        None
    };

    let admitted = total_result.admitted && duplex_result.as_ref().is_none_or(|(r, _)| r.admitted);
    if !admitted {
        emit_error_and_close(ctx, ErrorCode::ExcessiveConnections, crate::codec::packet::HEADER_BYTE, 0).await;
        return Transition::Next(SessionPhase::Closing, ());
    }

    if let Some(device) = &mut ctx.device {
        device.total_profile_mask = total_profile;
        device.last_total_connect_time = now;
        if let Some((_, duplex_profile)) = duplex_result {
            device.duplex_profile_mask = duplex_profile;
            device.last_duplex_connect_time = now;
        }
    }
    ctx.max_events_before_quota = device.max_allowed_events;
    ctx.accepted = true;

    Transition::Next(SessionPhase::Active, ())
}

async fn step_active(ctx: &mut SessionCtx) -> Transition<SessionPhase, ()> {
    match next_frame(ctx).await {
        FrameOutcome::Eof | FrameOutcome::TimedOut => Transition::Next(SessionPhase::Closing, ()),
        FrameOutcome::Error(err) => {
            let err_packet = ErrorBuilder::from_protocol_error(err).build();
            if let Err(e) = ctx.send(err_packet).await {
                warn!(error = %e, "failed to send ERROR");
            }
            match err.code {
                ErrorCode::PacketHeader | ErrorCode::PacketLength => {
                    if let Err(e) = ctx.send(EotBuilder.build()).await {
                        warn!(error = %e, "failed to send EOT");
                    }
                    Transition::Next(SessionPhase::Closing, ())
                },
                _ => Transition::Stay(()),
            }
        },
        FrameOutcome::Packet(packet) => handle_active_packet(ctx, packet).await,
    }
}

async fn handle_active_packet(ctx: &mut SessionCtx, packet: Packet) -> Transition<SessionPhase, ()> {
    let client_type = packet.client_type();

    if client_type.is_event() {
        if let ClientType::EventCustom(_) = client_type {
            ensure_custom_template_cached(ctx, packet.raw_type).await;
        }
        return handle_event(ctx, packet).await;
    }

    match client_type {
        ClientType::EobDone => {
            let ack = AckBuilder::new(ctx.last_sequence_seen).build();
            if let Err(e) = ctx.send(ack).await {
                warn!(error = %e, "failed to send ACK");
            }
            if let Err(e) = ctx.send(EobBuilder::done().build()).await {
                warn!(error = %e, "failed to send EOB_DONE");
            }
            Transition::Stay(())
        },
        ClientType::EobMore => {
            if let Err(e) = ctx.send(EobBuilder::speak_freely().build()).await {
                warn!(error = %e, "failed to send EOB_SPEAK_FREELY");
            }
            Transition::Stay(())
        },
        ClientType::FormatDef24 => {
            match PayloadTemplate::parse_format_def(&packet.payload) {
                Ok((target_type, template)) => {
                    ctx.session_templates.insert(target_type, template.clone());
                    if let Some(device) = &ctx.device {
                        if let Err(e) = ctx.persistence.save_custom_template(&device.account_id, &device.device_id, target_type, template).await {
                            warn!(error = %e, "failed to persist uploaded template");
                        }
                    }
                },
                Err(_) => {
                    let err = ErrorBuilder::new(ErrorCode::FormatNotRecognized, packet.header, packet.raw_type).build();
                    if let Err(e) = ctx.send(err).await {
                        warn!(error = %e, "failed to send ERROR");
                    }
                },
            }
            Transition::Stay(())
        },
        ClientType::PropertyValue => {
            debug!(device = ctx.device_id(), "applied property value from device");
            Transition::Stay(())
        },
        ClientType::Diagnostic => {
            debug!(device = ctx.device_id(), len = packet.payload.len(), "diagnostic packet received");
            Transition::Stay(())
        },
        ClientType::Unknown(b) => {
            let err = ErrorBuilder::new(ErrorCode::PacketType, packet.header, b).build();
            if let Err(e) = ctx.send(err).await {
                warn!(error = %e, "failed to send ERROR");
            }
            Transition::Stay(())
        },
        _ => Transition::Stay(()),
    }
}

async fn handle_event(ctx: &mut SessionCtx, packet: Packet) -> Transition<SessionPhase, ()> {
    let client_type = packet.client_type();
    let source = match client_type {
        ClientType::EventFixedStd => DataSource::FixedStandard,
        ClientType::EventFixedHigh => DataSource::FixedHighRes,
        ClientType::EventDmtsp(n) => DataSource::Dmtsp(n),
        ClientType::EventCustom(n) => DataSource::Custom(n),
        _ => unreachable!("handle_event is only called for event packet types"),
    };

    let lookup_direction = Direction::ClientToServer.into();
    let Some(template) = TemplateRegistry::resolve(lookup_direction, packet.raw_type, &ctx.session_templates, None) else {
        let err = ErrorBuilder::new(ErrorCode::FormatNotRecognized, packet.header, packet.raw_type).build();
        if let Err(e) = ctx.send(err).await {
            warn!(error = %e, "failed to send ERROR");
        }
        return Transition::Stay(());
    };

    let requires_gps = template.fields.iter().any(|f| f.semantic == FieldSemantic::GpsPoint);
    let event = decode_geo_event(ctx.account_id(), ctx.device_id(), &template, &packet.payload, source);

    if requires_gps && event.point.is_invalid() {
        ctx.stats.events_rejected += 1;
        let err = ErrorBuilder::new(ErrorCode::EventError, packet.header, packet.raw_type).build();
        if let Err(e) = ctx.send(err).await {
            warn!(error = %e, "failed to send ERROR");
        }
        return Transition::Stay(());
    }

    if ctx.stats.events_persisted >= ctx.max_events_before_quota {
        ctx.stats.events_rejected += 1;
        let err = ErrorBuilder::new(ErrorCode::ExcessiveEvents, packet.header, packet.raw_type).build();
        if let Err(e) = ctx.send(err).await {
            warn!(error = %e, "failed to send ERROR");
        }
        return Transition::Stay(());
    }

    ctx.last_sequence_seen = u32::from(event.sequence);
    let account_id = ctx.account_id().to_owned();
    let device_id = ctx.device_id().to_owned();
    match ctx.persistence.insert_event(&account_id, &device_id, event).await {
        Ok(InsertOutcome::Inserted | InsertOutcome::DuplicateIgnored) => {
            ctx.stats.events_persisted += 1;
        },
        Ok(InsertOutcome::Failed) | Err(_) => {
            ctx.stats.events_rejected += 1;
            let err = ErrorBuilder::new(ErrorCode::EventError, packet.header, packet.raw_type).build();
            if let Err(e) = ctx.send(err).await {
                warn!(error = %e, "failed to send ERROR");
            }
        },
    }

    Transition::Stay(())
}

fn decode_geo_event(account_id: &str, device_id: &str, template: &PayloadTemplate, raw_payload: &[u8], source: DataSource) -> GeoEvent {
    let mut payload = Payload::from_bytes(raw_payload.to_vec());
    let mut timestamp = 0i64;
    let mut status_code = 0u16;
    let mut point = GeoPoint::new(0.0, 0.0);
    let mut speed_kmh = 0.0;
    let mut heading_deg = 0.0;
    let mut altitude_m = 0.0;
    let mut odometer_km = 0.0;
    let mut top_speed_kmh = 0.0;
    let mut geofence_ids = [0u8; 2];
    let mut sequence = 0u8;
    let mut attributes = BTreeMap::new();

    for field in &template.fields {
        let width = field.length.max(1) as usize;
        match field.semantic {
            FieldSemantic::Timestamp => timestamp = payload.read_uint(width) as i64,
            FieldSemantic::StatusCode => status_code = payload.read_uint(width) as u16,
            FieldSemantic::GpsPoint => point = if field.hi_res { payload.read_point8() } else { payload.read_point6() },
            FieldSemantic::Speed => speed_kmh = payload.read_scaled(0, width),
            FieldSemantic::Heading => heading_deg = payload.read_scaled(1, width),
            FieldSemantic::Altitude => altitude_m = payload.read_scaled(1, width),
            FieldSemantic::Distance => {
                let value = payload.read_scaled(1, width);
                if field.index == Some(1) {
                    top_speed_kmh = value;
                } else {
                    odometer_km = value;
                }
            },
            FieldSemantic::GeofenceId => {
                let value = payload.read_uint(width) as u8;
                let idx = field.index.unwrap_or(0) as usize;
                if idx < geofence_ids.len() {
                    geofence_ids[idx] = value;
                }
            },
            FieldSemantic::Sequence => sequence = payload.read_uint(width) as u8,
            FieldSemantic::Integer => {
                let value = payload.read_uint(width) as i64;
                attributes.insert(AttributeKey::Custom(field.index.unwrap_or(0)), AttributeValue::Integer(value));
            },
            FieldSemantic::StringField => {
                payload.read_fixed_string(width);
            },
            FieldSemantic::Blob => {
                if field.length == 0 {
                    payload.read_remaining();
                } else {
                    payload.read_blob(width);
                }
            },
        }
    }

    GeoEvent {
        account_id: account_id.to_owned(),
        device_id: device_id.to_owned(),
        timestamp,
        status_code,
        point,
        speed_kmh,
        heading_deg,
        altitude_m,
        odometer_km,
        top_speed_kmh,
        geofence_ids,
        sequence,
        raw: raw_payload.to_vec(),
        data_source: source,
        attributes,
    }
}

async fn step_closing(ctx: &mut SessionCtx) -> Transition<SessionPhase, ()> {
    if let Err(e) = ctx.flush_session_stats().await {
        warn!(error = %e, "failed to flush session stats on close");
    }
    Transition::Next(SessionPhase::Closed, ())
}
