// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Payload Template Registry (§4.2): maps `(direction, packet-type)` to an
//! ordered list of typed fields, used by the codec to drive CSV encoding and
//! to decode/encode custom event layouts.
//!
//! Lookup order for a client packet is in-session override, then per-device
//! stored override, then this module's static table ([`TemplateRegistry::resolve`]);
//! the first two layers live with the session and the persistence adapter
//! respectively, so this module only owns the static table and the shared
//! [`PayloadTemplate`]/[`FieldDescriptor`] shapes.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::codec::{geo::GeoPoint, payload::Payload};

/// Which side of the wire a template applies to. Mirrors
/// [`crate::codec::packet::Direction`] but is kept separate since a template
/// is a property of a packet *type*, not of a decoded packet value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateDirection {
    ClientToServer,
    ServerToClient,
}

/// A field's semantic role within a template (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSemantic {
    Timestamp,
    StatusCode,
    GpsPoint,
    Speed,
    Heading,
    Altitude,
    Distance,
    GeofenceId,
    Sequence,
    Integer,
    StringField,
    Blob,
}

impl FieldSemantic {
    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Timestamp,
            1 => Self::StatusCode,
            2 => Self::GpsPoint,
            3 => Self::Speed,
            4 => Self::Heading,
            5 => Self::Altitude,
            6 => Self::Distance,
            7 => Self::GeofenceId,
            8 => Self::Sequence,
            9 => Self::Integer,
            10 => Self::StringField,
            11 => Self::Blob,
            _ => return None,
        })
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TemplateError {
    #[error("csv column malformed")]
    Malformed,
    #[error("csv column count does not match template field count")]
    FieldCountMismatch,
    #[error("FORMAT_DEF_24 payload malformed")]
    BadFormatDef,
}

/// One field's wire shape: `(semanticType, hiRes, index, length)` (§3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub semantic: FieldSemantic,
    pub hi_res: bool,
    /// Disambiguates repeated semantic tags (e.g. two geofence ids).
    pub index: Option<u8>,
    /// Wire width in bytes. `0` means "whatever remains in the payload" —
    /// only legal on a template's trailing field.
    pub length: u8,
}

impl FieldDescriptor {
    pub const fn new(semantic: FieldSemantic, hi_res: bool, index: Option<u8>, length: u8) -> Self {
        Self { semantic, hi_res, index, length }
    }

    fn read_csv_value(&self, payload: &mut Payload) -> String {
        match self.semantic {
            FieldSemantic::GpsPoint => {
                let point = if self.hi_res { payload.read_point8() } else { payload.read_point6() };
                format!("{};{}", point.latitude, point.longitude)
            },
            FieldSemantic::Timestamp
            | FieldSemantic::StatusCode
            | FieldSemantic::GeofenceId
            | FieldSemantic::Sequence
            | FieldSemantic::Integer => self.width(payload).to_string(),
            FieldSemantic::Speed => format!("{:.0}", payload.read_scaled(0, self.read_width(payload))),
            FieldSemantic::Heading | FieldSemantic::Altitude | FieldSemantic::Distance => {
                format!("{:.1}", payload.read_scaled(1, self.read_width(payload)))
            },
            FieldSemantic::StringField => payload.read_fixed_string(self.read_width(payload)),
            FieldSemantic::Blob => hex::encode(self.read_blob(payload)),
        }
    }

    fn write_csv_value(&self, payload: &mut Payload, col: &str) -> Result<(), TemplateError> {
        match self.semantic {
            FieldSemantic::GpsPoint => {
                let mut parts = col.splitn(2, ';');
                let lat: f64 = parts.next().and_then(|s| s.parse().ok()).ok_or(TemplateError::Malformed)?;
                let lon: f64 = parts.next().and_then(|s| s.parse().ok()).ok_or(TemplateError::Malformed)?;
                let point = GeoPoint::new(lat, lon);
                if self.hi_res {
                    payload.write_point8(&point);
                } else {
                    payload.write_point6(&point);
                }
            },
            FieldSemantic::Timestamp
            | FieldSemantic::StatusCode
            | FieldSemantic::GeofenceId
            | FieldSemantic::Sequence
            | FieldSemantic::Integer => {
                let value: u64 = col.parse().map_err(|_| TemplateError::Malformed)?;
                payload.write_uint(value, self.length.max(1) as usize);
            },
            FieldSemantic::Speed => {
                let value: f64 = col.parse().map_err(|_| TemplateError::Malformed)?;
                payload.write_scaled(value, 0, self.length.max(1) as usize);
            },
            FieldSemantic::Heading | FieldSemantic::Altitude | FieldSemantic::Distance => {
                let value: f64 = col.parse().map_err(|_| TemplateError::Malformed)?;
                payload.write_scaled(value, 1, self.length.max(1) as usize);
            },
            FieldSemantic::StringField => payload.write_fixed_string(col, self.length as usize, b' '),
            FieldSemantic::Blob => {
                let bytes = hex::decode(col).map_err(|_| TemplateError::Malformed)?;
                payload.write_blob(&bytes);
            },
        }
        Ok(())
    }

    // For fixed-width integer-ish fields, `width()` reads now (consuming
    // from `payload`) since CSV columns have no independent length to
    // validate against.
    fn width(&self, payload: &mut Payload) -> u64 {
        payload.read_uint(self.length.max(1) as usize)
    }

    fn read_width(&self, _payload: &Payload) -> usize {
        self.length.max(1) as usize
    }

    fn read_blob(&self, payload: &mut Payload) -> Vec<u8> {
        if self.length == 0 {
            payload.read_remaining()
        } else {
            payload.read_blob(self.length as usize)
        }
    }
}

/// An ordered sequence of [`FieldDescriptor`]s for one `(direction,
/// packet-type)` pair (§3, §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadTemplate {
    pub packet_type: u8,
    pub fields: Vec<FieldDescriptor>,
}

impl PayloadTemplate {
    pub const fn new(packet_type: u8, fields: Vec<FieldDescriptor>) -> Self {
        Self { packet_type, fields }
    }

    /// CSV-decode: one column per field (§9 open question (b) — no
    /// fallthrough accumulation across fields).
    pub fn decode_csv(&self, csv: &[u8]) -> Result<Vec<u8>, TemplateError> {
        let text = std::str::from_utf8(csv).map_err(|_| TemplateError::Malformed)?;
        let cols: Vec<&str> = text.split(',').collect();
        if cols.len() != self.fields.len() {
            return Err(TemplateError::FieldCountMismatch);
        }
        let mut payload = Payload::new();
        for (field, col) in self.fields.iter().zip(cols.iter()) {
            field.write_csv_value(&mut payload, col)?;
        }
        Ok(payload.into_bytes())
    }

    pub fn encode_csv(&self, payload_bytes: &[u8]) -> String {
        let mut payload = Payload::from_bytes(payload_bytes.to_vec());
        self.fields.iter().map(|field| field.read_csv_value(&mut payload)).collect::<Vec<_>>().join(",")
    }

    /// Parse a `FORMAT_DEF_24` upload payload into the target packet-type
    /// byte and its template (§4.2, §8 scenario 4).
    ///
    /// Wire shape: `target_type:1, field_count:1, (tag:1, hi_res:1,
    /// index:1, length:1) * field_count`. `index == 0xFF` means "no index".
    /// This layout is not pinned down by the wire protocol's authoritative
    /// byte assignments beyond the `(semanticType, hiRes, index, length)`
    /// tuple shape in §4.2, so it is this crate's own encoding of that
    /// tuple rather than a value taken from elsewhere.
    pub fn parse_format_def(payload: &[u8]) -> Result<(u8, Self), TemplateError> {
        if payload.len() < 2 {
            return Err(TemplateError::BadFormatDef);
        }
        let target_type = payload[0];
        let count = payload[1] as usize;
        let body = &payload[2..];
        if body.len() != count * 4 {
            return Err(TemplateError::BadFormatDef);
        }
        let mut fields = Vec::with_capacity(count);
        for chunk in body.chunks_exact(4) {
            let semantic = FieldSemantic::from_tag(chunk[0]).ok_or(TemplateError::BadFormatDef)?;
            let hi_res = chunk[1] != 0;
            let index = if chunk[2] == 0xFF { None } else { Some(chunk[2]) };
            let length = chunk[3];
            fields.push(FieldDescriptor::new(semantic, hi_res, index, length));
        }
        Ok((target_type, Self::new(target_type, fields)))
    }
}

fn geo_event_fields(hi_res: bool) -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new(FieldSemantic::Timestamp, false, None, 4),
        FieldDescriptor::new(FieldSemantic::StatusCode, false, None, 2),
        FieldDescriptor::new(FieldSemantic::GpsPoint, hi_res, None, if hi_res { 8 } else { 6 }),
        FieldDescriptor::new(FieldSemantic::Speed, false, None, 1),
        FieldDescriptor::new(FieldSemantic::Heading, false, None, 1),
        FieldDescriptor::new(FieldSemantic::Altitude, false, None, 2),
        FieldDescriptor::new(FieldSemantic::Distance, false, None, 3),
        FieldDescriptor::new(FieldSemantic::Distance, false, Some(1), 1), // top speed, reuses the distance-like scaled encoding
        FieldDescriptor::new(FieldSemantic::GeofenceId, false, Some(0), 1),
        FieldDescriptor::new(FieldSemantic::GeofenceId, false, Some(1), 1),
        FieldDescriptor::new(FieldSemantic::Sequence, false, None, 1),
    ]
}

static STATIC_TEMPLATES: Lazy<HashMap<(TemplateDirection, u8), PayloadTemplate>> = Lazy::new(|| {
    use TemplateDirection::{ClientToServer, ServerToClient};

    let mut m = HashMap::new();

    m.insert((ClientToServer, 0x11), PayloadTemplate::new(0x11, vec![FieldDescriptor::new(FieldSemantic::Integer, false, None, 6)]));
    m.insert((ClientToServer, 0x12), PayloadTemplate::new(0x12, vec![FieldDescriptor::new(FieldSemantic::StringField, false, None, 20)]));
    m.insert((ClientToServer, 0x13), PayloadTemplate::new(0x13, vec![FieldDescriptor::new(FieldSemantic::StringField, false, None, 20)]));
    m.insert((ClientToServer, 0x30), PayloadTemplate::new(0x30, geo_event_fields(false)));
    m.insert((ClientToServer, 0x31), PayloadTemplate::new(0x31, geo_event_fields(true)));
    for dmtsp in 0x50..=0x5Fu8 {
        m.insert((ClientToServer, dmtsp), PayloadTemplate::new(dmtsp, geo_event_fields(false)));
    }
    m.insert((ClientToServer, 0xB0), PayloadTemplate::new(0xB0, vec![
        FieldDescriptor::new(FieldSemantic::Integer, false, None, 2),
        FieldDescriptor::new(FieldSemantic::Blob, false, None, 0),
    ]));
    m.insert((ClientToServer, 0xD0), PayloadTemplate::new(0xD0, vec![FieldDescriptor::new(FieldSemantic::Blob, false, None, 0)]));
    m.insert((ClientToServer, 0xE0), error_template(0xE0));

    m.insert((ServerToClient, 0x00), PayloadTemplate::new(0x00, vec![]));
    m.insert((ServerToClient, 0x01), PayloadTemplate::new(0x01, vec![]));
    m.insert((ServerToClient, 0xA0), PayloadTemplate::new(0xA0, vec![FieldDescriptor::new(FieldSemantic::Sequence, false, None, 4)]));
    m.insert((ServerToClient, 0xB0), PayloadTemplate::new(0xB0, vec![FieldDescriptor::new(FieldSemantic::Integer, false, None, 4)]));
    m.insert((
        ServerToClient,
        0xB1,
    ), PayloadTemplate::new(0xB1, vec![
        FieldDescriptor::new(FieldSemantic::Integer, false, None, 2),
        FieldDescriptor::new(FieldSemantic::Blob, false, None, 0),
    ]));
    m.insert((
        ServerToClient,
        0xC0,
    ), PayloadTemplate::new(0xC0, vec![
        FieldDescriptor::new(FieldSemantic::Integer, false, None, 1),
        FieldDescriptor::new(FieldSemantic::Integer, false, Some(1), 3),
        FieldDescriptor::new(FieldSemantic::Blob, false, None, 0),
    ]));
    m.insert((ServerToClient, 0xE0), error_template(0xE0));
    m.insert((ServerToClient, 0xFF), PayloadTemplate::new(0xFF, vec![]));

    m
});

fn error_template(packet_type: u8) -> PayloadTemplate {
    PayloadTemplate::new(packet_type, vec![
        FieldDescriptor::new(FieldSemantic::Integer, false, None, 2),
        FieldDescriptor::new(FieldSemantic::Integer, false, Some(1), 1),
        FieldDescriptor::new(FieldSemantic::Integer, false, Some(2), 1),
        FieldDescriptor::new(FieldSemantic::Blob, false, None, 0),
    ])
}

impl From<crate::codec::packet::Direction> for TemplateDirection {
    fn from(direction: crate::codec::packet::Direction) -> Self {
        match direction {
            crate::codec::packet::Direction::ClientToServer => Self::ClientToServer,
            crate::codec::packet::Direction::ServerToClient => Self::ServerToClient,
        }
    }
}

/// Resolves templates through the three-tier lookup order of §4.2. Owns
/// only the static tier; callers pass in whatever session/device overrides
/// apply.
pub struct TemplateRegistry;

impl TemplateRegistry {
    pub fn static_lookup(direction: TemplateDirection, packet_type: u8) -> Option<PayloadTemplate> {
        STATIC_TEMPLATES.get(&(direction, packet_type)).cloned()
    }

    pub fn resolve(
        direction: TemplateDirection,
        packet_type: u8,
        session_overrides: &HashMap<u8, PayloadTemplate>,
        device_override: Option<&PayloadTemplate>,
    ) -> Option<PayloadTemplate> {
        if let Some(t) = session_overrides.get(&packet_type) {
            return Some(t.clone());
        }
        if let Some(t) = device_override {
            return Some(t.clone());
        }
        Self::static_lookup(direction, packet_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_round_trips_a_known_template() {
        let template = TemplateRegistry::static_lookup(TemplateDirection::ClientToServer, 0x30).expect("registered");
        let mut payload = Payload::new();
        payload.write_uint(1_700_000_000, 4);
        payload.write_uint(42, 2);
        payload.write_point6(&GeoPoint::new(41.0, 29.0));
        payload.write_uint(60, 1);
        payload.write_uint(180, 1);
        payload.write_uint(100, 2);
        payload.write_uint(12345, 3);
        payload.write_uint(90, 1);
        payload.write_uint(1, 1);
        payload.write_uint(2, 1);
        payload.write_uint(7, 1);
        let bytes = payload.into_bytes();

        let csv = template.encode_csv(&bytes);
        assert_eq!(csv.split(',').count(), template.fields.len());
        let decoded = template.decode_csv(csv.as_bytes()).expect("valid csv");
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn format_def_round_trips_into_a_template() {
        // target 0x72, two fields: TIMESTAMP:4, GPS:6 (index 0xFF = none, hi_res 0)
        let payload = vec![0x72, 2, 0, 0, 0xFF, 4, 2, 0, 0xFF, 6];
        let (target, template) = PayloadTemplate::parse_format_def(&payload).expect("valid format def");
        assert_eq!(target, 0x72);
        assert_eq!(template.fields.len(), 2);
        assert_eq!(template.fields[0].semantic, FieldSemantic::Timestamp);
        assert_eq!(template.fields[1].semantic, FieldSemantic::GpsPoint);
    }

    #[test]
    fn unknown_custom_type_has_no_static_template() {
        assert!(TemplateRegistry::static_lookup(TemplateDirection::ClientToServer, 0x75).is_none());
    }
}
