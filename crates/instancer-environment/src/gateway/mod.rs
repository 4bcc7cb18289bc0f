// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute gateway module - adapters over the remote compute provider.

pub mod http;
pub mod mock;
pub mod resilient;
mod traits;

pub use http::HttpComputeGateway;
pub use mock::MockGateway;
pub use resilient::{ResilienceConfig, ResilientGateway};
pub use traits::*;
