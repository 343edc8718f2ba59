// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cfg;
pub mod codec;
pub mod domain;
pub mod identity;
pub mod persistence;
pub mod rate;
pub mod session;
pub mod templates;
pub mod transport;
