// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! An in-memory `Persistence` implementation. Not a spec deliverable — the
//! real store is an external collaborator (§1) — but required so the crate
//! builds and tests standalone, and useful as the default store for a
//! single-process deployment.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    domain::{Account, Device, GeoEvent, InsertOutcome},
    persistence::{Persistence, PersistenceError},
    rate::RateProfile,
    templates::PayloadTemplate,
};

type EventKey = (String, String, i64, u16);

/// Thread-safe in-memory store, keyed the same way the §6 interface is
/// keyed. Event insertion is at-most-once on `(accountId, deviceId,
/// timestamp, statusCode)` via `DashMap::entry` (§3 invariant).
#[derive(Default)]
pub struct MemoryStore {
    accounts: DashMap<String, Account>,
    devices: DashMap<(String, String), Device>,
    unique_ids: DashMap<u64, (String, String)>,
    events: DashMap<EventKey, GeoEvent>,
    custom_templates: DashMap<(String, String, u8), PayloadTemplate>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_account(&self, account: Account) {
        self.accounts.insert(account.account_id.clone(), account);
    }

    pub fn insert_device(&self, device: Device) {
        self.unique_ids.insert(device.unique_id, (device.account_id.clone(), device.device_id.clone()));
        self.devices.insert((device.account_id.clone(), device.device_id.clone()), device);
    }

    pub fn events_snapshot(&self) -> HashMap<EventKey, GeoEvent> {
        self.events.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn lookup_account(&self, account_id: &str) -> Result<Option<Account>, PersistenceError> {
        Ok(self.accounts.get(account_id).map(|e| e.value().clone()))
    }

    async fn lookup_device(&self, account_id: &str, device_id: &str) -> Result<Option<Device>, PersistenceError> {
        Ok(self.devices.get(&(account_id.to_owned(), device_id.to_owned())).map(|e| e.value().clone()))
    }

    async fn lookup_device_by_unique_id(&self, unique_id: u64) -> Result<Option<(Account, Device)>, PersistenceError> {
        let Some(key) = self.unique_ids.get(&unique_id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let device = self.devices.get(&key).map(|e| e.value().clone());
        let account = self.accounts.get(&key.0).map(|e| e.value().clone());
        Ok(device.zip(account).map(|(d, a)| (a, d)))
    }

    async fn insert_event(&self, account_id: &str, device_id: &str, event: GeoEvent) -> Result<InsertOutcome, PersistenceError> {
        let key = (account_id.to_owned(), device_id.to_owned(), event.timestamp, event.status_code);
        if self.events.contains_key(&key) {
            return Ok(InsertOutcome::DuplicateIgnored);
        }
        self.events.insert(key, event);
        Ok(InsertOutcome::Inserted)
    }

    async fn update_device_session_stats(
        &self,
        account_id: &str,
        device_id: &str,
        total_profile: RateProfile,
        last_total_connect_time: i64,
        duplex_profile: RateProfile,
        last_duplex_connect_time: i64,
    ) -> Result<(), PersistenceError> {
        let key = (account_id.to_owned(), device_id.to_owned());
        let mut entry = self
            .devices
            .get_mut(&key)
            .ok_or_else(|| PersistenceError::Backend(format!("no such device {account_id}/{device_id}")))?;
        entry.total_profile_mask = total_profile;
        entry.last_total_connect_time = last_total_connect_time;
        entry.duplex_profile_mask = duplex_profile;
        entry.last_duplex_connect_time = last_duplex_connect_time;
        Ok(())
    }

    async fn load_custom_template(
        &self,
        account_id: &str,
        device_id: &str,
        packet_type: u8,
    ) -> Result<Option<PayloadTemplate>, PersistenceError> {
        let key = (account_id.to_owned(), device_id.to_owned(), packet_type);
        Ok(self.custom_templates.get(&key).map(|e| e.value().clone()))
    }

    async fn save_custom_template(
        &self,
        account_id: &str,
        device_id: &str,
        packet_type: u8,
        template: PayloadTemplate,
    ) -> Result<(), PersistenceError> {
        self.custom_templates.insert((account_id.to_owned(), device_id.to_owned(), packet_type), template);
        Ok(())
    }
}
