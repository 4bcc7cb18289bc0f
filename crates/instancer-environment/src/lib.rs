// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instancer Environment - Challenge Instance Lifecycle
//!
//! Gives each owner (a user or a team) at most one on-demand cloud instance
//! of a challenge at a time, binds a random secret to it, and reclaims it on
//! solve, on request, or when its lifetime runs out.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Platform request layer                              │
//! │          (sessions, challenge pages, solve submissions)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ handlers
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                instancer-environment (This Crate)                       │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  Lifecycle  │  │   Reclaim   │  │   Secret    │  │   Compute   │     │
//! │  │   Manager   │  │  Scheduler  │  │   Binding   │  │   Gateway   │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                                │
//!           ▼                                                ▼
//! ┌───────────────────────────┐                  ┌─────────────────────────┐
//! │      instancer-core       │                  │    Compute provider     │
//! │ (PostgreSQL / SQLite)     │                  │    (REST API)           │
//! └───────────────────────────┘                  └─────────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `Allocate` | Launch an instance for an owner holding none |
//! | `Poll` | Live state and endpoint of an instance |
//! | `Reclaim` | Tear down an instance (timeout, solved, admin) |
//! | `CheckSecret` | Compare a submission with the bound secret |
//! | `SubmitSecret` | Check, then reclaim as solved |
//! | `OwnerInstances` / `ListActive` | Listings without secrets |
//! | `ConfigStatus` / `ListLaunchables` | Provider administration |
//!
//! # Modules
//!
//! - [`config`]: Environment-based configuration
//! - [`error`]: Error types and wire classification
//! - [`gateway`]: Compute provider adapters (HTTP, resilient decorator, mock)
//! - [`handlers`]: Request/response layer
//! - [`lifecycle`]: The lifecycle manager
//! - [`reclaim_scheduler`]: Background reclamation of expired instances
//! - [`runtime`]: Embeddable runtime wiring
//! - [`secret`]: Secret generation and bootstrap payloads

#![deny(missing_docs)]

/// Environment-based configuration.
pub mod config;

/// Error types.
pub mod error;

/// Compute provider adapters.
pub mod gateway;

/// Request handlers.
pub mod handlers;

/// Instance lifecycle manager.
pub mod lifecycle;

/// Background reclamation of expired instances.
pub mod reclaim_scheduler;

/// Embeddable runtime.
pub mod runtime;

/// Secret generation and bootstrap payloads.
pub mod secret;

pub use error::{Error, ErrorKind, LifecycleError, Result};
pub use lifecycle::{LifecycleManager, Requester};
