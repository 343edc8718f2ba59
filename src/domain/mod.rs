// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Concrete record types for Account, Device and GeoEvent (§3). Kept as
//! plain structs per §9's "dynamic polymorphism on DB field values" redesign
//! flag: no shared abstract base, no reflective field access — the only
//! place that talks in terms of loosely-typed columns is the persistence
//! adapter boundary (§6), not these types.

use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{codec::geo::GeoPoint, rate::RateProfile};

bitflags! {
    /// `device.supportedEncodings` (§3): a non-empty subset of the four
    /// wire encodings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EncodingSet: u8 {
        const BINARY = 0b0001;
        const BASE64 = 0b0010;
        const HEX    = 0b0100;
        const CSV    = 0b1000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub description: String,
    pub is_active: bool,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub account_id: String,
    pub device_id: String,
    pub unique_id: u64,
    pub description: String,
    pub is_active: bool,
    pub supported_encodings: EncodingSet,
    pub unit_limit_interval_minutes: u32,
    pub max_allowed_events: u32,
    pub total_max_conn: u32,
    pub total_max_conn_per_min: u32,
    pub last_total_connect_time: i64,
    pub total_profile_mask: RateProfile,
    pub duplex_max_conn: u32,
    pub duplex_max_conn_per_min: u32,
    pub last_duplex_connect_time: i64,
    pub duplex_profile_mask: RateProfile,
    /// Logging-only cache of whether the device has reported movement
    /// recently; never persisted, never read back from storage.
    pub motion_streak: bool,
}

/// Tag-keyed supplemental fields a custom (FORMAT_DEF_24) template can
/// carry beyond the fixed GeoEvent columns — engine hours, fuel level,
/// digital input bitmask, battery voltage, signal strength, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AttributeKey {
    EngineHours,
    FuelLevel,
    InputBitmask,
    BatteryVoltage,
    SignalStrength,
    Custom(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoEvent {
    pub account_id: String,
    pub device_id: String,
    pub timestamp: i64,
    pub status_code: u16,
    pub point: GeoPoint,
    pub speed_kmh: f64,
    pub heading_deg: f64,
    pub altitude_m: f64,
    pub odometer_km: f64,
    pub top_speed_kmh: f64,
    pub geofence_ids: [u8; 2],
    pub sequence: u8,
    pub raw: Vec<u8>,
    pub data_source: DataSource,
    pub attributes: BTreeMap<AttributeKey, AttributeValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    FixedStandard,
    FixedHighRes,
    Dmtsp(u8),
    Custom(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateIgnored,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub events_persisted: u32,
    pub events_rejected: u32,
}
