// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The Persistence Interface (§6): the sole external collaborator the
//! protocol core depends on. Modelled as an async trait, stored behind
//! `Arc<dyn Persistence>` so the transport layer can share one instance
//! across every session without generic fan-out.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    domain::{Account, Device, GeoEvent, InsertOutcome},
    rate::RateProfile,
    templates::PayloadTemplate,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("persistence backend unavailable: {0}")]
    Backend(String),
}

/// §6 Persistence Interface. `load_custom_template`/`save_custom_template`
/// are a supplemental pair of methods filling the per-device override tier
/// that §4.2's three-tier template lookup requires but §6's original
/// interface sketch does not name.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn lookup_account(&self, account_id: &str) -> Result<Option<Account>, PersistenceError>;

    async fn lookup_device(&self, account_id: &str, device_id: &str) -> Result<Option<Device>, PersistenceError>;

    async fn lookup_device_by_unique_id(&self, unique_id: u64) -> Result<Option<(Account, Device)>, PersistenceError>;

    async fn insert_event(&self, account_id: &str, device_id: &str, event: GeoEvent) -> Result<InsertOutcome, PersistenceError>;

    async fn update_device_session_stats(
        &self,
        account_id: &str,
        device_id: &str,
        total_profile: RateProfile,
        last_total_connect_time: i64,
        duplex_profile: RateProfile,
        last_duplex_connect_time: i64,
    ) -> Result<(), PersistenceError>;

    async fn load_custom_template(
        &self,
        account_id: &str,
        device_id: &str,
        packet_type: u8,
    ) -> Result<Option<PayloadTemplate>, PersistenceError>;

    async fn save_custom_template(
        &self,
        account_id: &str,
        device_id: &str,
        packet_type: u8,
        template: PayloadTemplate,
    ) -> Result<(), PersistenceError>;
}
