// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Identity Resolver (§4.4): turns a device-supplied identifier into an
//! `(Account, Device)` pair via the Persistence Interface.

use thiserror::Error;

use crate::{
    codec::error::ErrorCode,
    domain::{Account, Device},
    persistence::Persistence,
};

/// A 48-bit unique ID's top 16 bits must be clear (§9 open question (a)):
/// the source's checksum-over-zero-bytes behaviour is reimplemented as a
/// plain range check, with the checksum itself treated as unused.
const TOP16_OF_48_MASK: u64 = 0xFFFF_0000_0000;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IdentityError {
    #[error("unique id invalid")]
    UniqueIdInvalid,
    #[error("account invalid")]
    AccountInvalid,
    #[error("device invalid")]
    DeviceInvalid,
}

impl IdentityError {
    pub const fn error_code(self) -> ErrorCode {
        match self {
            Self::UniqueIdInvalid => ErrorCode::UniqueIdInvalid,
            Self::AccountInvalid => ErrorCode::AccountInvalid,
            Self::DeviceInvalid => ErrorCode::DeviceInvalid,
        }
    }
}

/// Resolve a device by its 48-bit unique ID (§4.4 "Unique-ID form").
pub async fn resolve_by_unique_id(persistence: &dyn Persistence, unique_id: u64) -> Result<(Account, Device), IdentityError> {
    if unique_id & TOP16_OF_48_MASK != 0 {
        return Err(IdentityError::UniqueIdInvalid);
    }
    match persistence.lookup_device_by_unique_id(unique_id).await {
        Ok(Some(pair)) => Ok(pair),
        _ => Err(IdentityError::UniqueIdInvalid),
    }
}

/// Resolve a device by its `(accountId, deviceId)` string pair (§4.4
/// "Account+Device form").
pub async fn resolve_by_account_device(
    persistence: &dyn Persistence,
    account_id: &str,
    device_id: &str,
) -> Result<(Account, Device), IdentityError> {
    let account = match persistence.lookup_account(account_id).await {
        Ok(Some(account)) if account.is_active => account,
        _ => return Err(IdentityError::AccountInvalid),
    };
    let device = match persistence.lookup_device(account_id, device_id).await {
        Ok(Some(device)) if device.is_active => device,
        _ => return Err(IdentityError::DeviceInvalid),
    };
    Ok((account, device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::EncodingSet, persistence::memory::MemoryStore, rate::RateProfile};

    fn sample_device() -> (Account, Device) {
        let account = Account {
            account_id: "acct".into(),
            description: String::new(),
            is_active: true,
            password_hash: String::new(),
        };
        let device = Device {
            account_id: "acct".into(),
            device_id: "dev".into(),
            unique_id: 0x0000_1234_5678,
            description: String::new(),
            is_active: true,
            supported_encodings: EncodingSet::BINARY | EncodingSet::CSV,
            unit_limit_interval_minutes: 60,
            max_allowed_events: 1000,
            total_max_conn: 10,
            total_max_conn_per_min: 5,
            last_total_connect_time: 0,
            total_profile_mask: RateProfile::new(60),
            duplex_max_conn: 10,
            duplex_max_conn_per_min: 5,
            last_duplex_connect_time: 0,
            duplex_profile_mask: RateProfile::new(60),
            motion_streak: false,
        };
        (account, device)
    }

    #[tokio::test]
    async fn unique_id_with_top_16_bits_set_is_rejected_before_any_lookup() {
        let store = MemoryStore::new();
        let err = resolve_by_unique_id(&store, 0xFFFF_0000_0000).await.unwrap_err();
        assert_eq!(err, IdentityError::UniqueIdInvalid);
    }

    #[tokio::test]
    async fn unique_id_resolves_to_the_matching_pair() {
        let store = MemoryStore::new();
        let (account, device) = sample_device();
        store.insert_account(account.clone());
        store.insert_device(device.clone());
        let (resolved_account, resolved_device) = resolve_by_unique_id(&store, device.unique_id).await.unwrap();
        assert_eq!(resolved_account.account_id, account.account_id);
        assert_eq!(resolved_device.device_id, device.device_id);
    }

    #[tokio::test]
    async fn inactive_account_rejects_account_device_resolution() {
        let store = MemoryStore::new();
        let (mut account, device) = sample_device();
        account.is_active = false;
        store.insert_account(account);
        store.insert_device(device.clone());
        let err = resolve_by_account_device(&store, &device.account_id, &device.device_id).await.unwrap_err();
        assert_eq!(err, IdentityError::AccountInvalid);
    }

    #[tokio::test]
    async fn missing_device_is_device_invalid() {
        let store = MemoryStore::new();
        let (account, _device) = sample_device();
        store.insert_account(account.clone());
        let err = resolve_by_account_device(&store, &account.account_id, "nonexistent").await.unwrap_err();
        assert_eq!(err, IdentityError::DeviceInvalid);
    }
}
