// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instancer Core - Instance Tracking Persistence
//!
//! This crate owns the durable state behind the instance lifecycle: which owner
//! holds which provider instance, until when, and with which secret. It also
//! stores the provider configuration singleton and the per-challenge launch
//! templates the lifecycle manager reads.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       instancer-environment                              │
//! │        (Lifecycle Manager, Reclaim Scheduler, Compute Gateway)           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    │ TrackerStore / ProviderConfigStore /
//!                                    │ TemplateCatalog
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     instancer-core (This Crate)                          │
//! │   ┌──────────────────────┐            ┌──────────────────────┐           │
//! │   │ PostgresPersistence  │            │  SqlitePersistence   │           │
//! │   └──────────────────────┘            └──────────────────────┘           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Owner Slot State Machine
//!
//! Each owner has at most one row in `instance_records`. The primary key on
//! `owner_id` is the only mutual exclusion between concurrent allocations.
//!
//! ```text
//!     (no row) ──reserve──▶ PENDING ──activate──▶ RUNNING ──claim──▶ RECLAIMING
//!        ▲                     │                                        │
//!        │   release / purge   │                                        │
//!        └─────────────────────┴────────────── finish_reclaim ◀─────────┘
//! ```
//!
//! # Modules
//!
//! - [`clock`]: Injectable wall clock with one-second resolution
//! - [`error`]: Error types for persistence operations
//! - [`migrations`]: Embedded PostgreSQL and SQLite migrations
//! - [`owner`]: Canonical owner identity
//! - [`persistence`]: Store traits, record types, and backends

#![deny(missing_docs)]

/// Injectable wall clock.
pub mod clock;

/// Error types for persistence operations.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Canonical owner identity.
pub mod owner;

/// Store traits, record types, and PostgreSQL/SQLite backends.
pub mod persistence;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use owner::OwnerId;
