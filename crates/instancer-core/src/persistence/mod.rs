// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for instancer-core.
//!
//! This module defines the store abstractions, the record types they exchange,
//! and the PostgreSQL and SQLite implementations.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::from_unix;
use crate::error::CoreError;
use crate::owner::OwnerId;

// ============================================================================
// Record Types
// ============================================================================

/// Persisted lifecycle status of an owner slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Slot reserved, provider launch in flight.
    Pending,
    /// Instance launched and tracked.
    Running,
    /// A reclaim has claimed the record and is terminating the instance.
    Reclaiming,
}

impl RecordStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Reclaiming => "reclaiming",
        }
    }

    /// Parse the database representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "reclaiming" => Some(Self::Reclaiming),
            _ => None,
        }
    }
}

/// Why an instance was reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimReason {
    /// The record passed its deadline.
    Timeout,
    /// The owner submitted the correct secret.
    Solved,
    /// An administrator terminated the instance.
    AdminTerminate,
}

impl ReclaimReason {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Solved => "solved",
            Self::AdminTerminate => "admin_terminate",
        }
    }

    /// Parse the database representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "timeout" => Some(Self::Timeout),
            "solved" => Some(Self::Solved),
            "admin_terminate" => Some(Self::AdminTerminate),
            _ => None,
        }
    }
}

impl fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An owner's launched instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    /// Owner holding the instance.
    pub owner_id: OwnerId,
    /// Challenge the instance was launched from.
    pub challenge_id: String,
    /// Either [`RecordStatus::Running`] or [`RecordStatus::Reclaiming`].
    pub status: RecordStatus,
    /// Handle assigned by the compute provider.
    pub provider_instance_id: String,
    /// Secret the owner must submit to solve the challenge.
    pub secret: String,
    /// Last reachable address reported by the provider.
    pub network_endpoint: Option<String>,
    /// When the provider accepted the launch.
    pub created_at: DateTime<Utc>,
    /// When the instance becomes eligible for automatic reclamation.
    pub deadline_at: DateTime<Utc>,
    /// Set once the record has been claimed for reclamation.
    pub reclaim_reason: Option<ReclaimReason>,
}

impl InstanceRecord {
    /// Whether the deadline has been reached at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline_at <= now
    }

    /// Seconds left before the deadline, zero once expired.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.deadline_at - now).num_seconds().max(0)
    }
}

/// An owner slot reserved by an allocation still waiting on the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReservation {
    /// Owner holding the reservation.
    pub owner_id: OwnerId,
    /// Challenge being launched.
    pub challenge_id: String,
    /// When the slot was reserved.
    pub reserved_at: DateTime<Utc>,
}

/// Whatever currently occupies an owner's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerSlot {
    /// Allocation in progress.
    Pending(PendingReservation),
    /// Launched instance (running or being reclaimed).
    Active(InstanceRecord),
}

impl OwnerSlot {
    /// Challenge the slot belongs to.
    pub fn challenge_id(&self) -> &str {
        match self {
            Self::Pending(p) => &p.challenge_id,
            Self::Active(r) => &r.challenge_id,
        }
    }

    /// Provider handle, once the instance has been launched.
    pub fn provider_instance_id(&self) -> Option<&str> {
        match self {
            Self::Pending(_) => None,
            Self::Active(r) => Some(&r.provider_instance_id),
        }
    }

    /// Persisted status of the slot.
    pub fn status(&self) -> RecordStatus {
        match self {
            Self::Pending(_) => RecordStatus::Pending,
            Self::Active(r) => r.status,
        }
    }
}

/// Result of trying to reserve an owner slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The slot was free and now belongs to the caller.
    Reserved,
    /// The owner already holds a slot.
    Occupied(OwnerSlot),
}

/// Data written when a reservation becomes a running record.
#[derive(Debug, Clone)]
pub struct NewInstanceRecord {
    /// Owner whose reservation is being activated.
    pub owner_id: OwnerId,
    /// Handle assigned by the compute provider.
    pub provider_instance_id: String,
    /// Secret embedded in the bootstrap payload.
    pub secret: String,
    /// Launch time.
    pub created_at: DateTime<Utc>,
    /// `created_at` plus the template's maximum lifetime.
    pub deadline_at: DateTime<Utc>,
}

/// How a reclaim addresses the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSelector {
    /// The owner's record.
    Owner(OwnerId),
    /// The record holding this provider handle.
    ProviderInstance(String),
}

impl fmt::Display for RecordSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner(owner) => write!(f, "owner:{}", owner),
            Self::ProviderInstance(id) => write!(f, "instance:{}", id),
        }
    }
}

/// Outcome of a reclaim, stored in the history table.
#[derive(Debug, Clone)]
pub struct ReclaimOutcome {
    /// Trigger of the reclaim.
    pub reason: ReclaimReason,
    /// When the record was removed.
    pub ended_at: DateTime<Utc>,
    /// Provider termination error that was swallowed, if any.
    pub terminate_error: Option<String>,
}

/// A reclaimed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    /// Database primary key.
    pub id: i64,
    /// Owner that held the instance.
    pub owner_id: OwnerId,
    /// Challenge the instance was launched from.
    pub challenge_id: String,
    /// Handle assigned by the compute provider.
    pub provider_instance_id: String,
    /// When the instance was launched.
    pub started_at: DateTime<Utc>,
    /// When the record was removed.
    pub ended_at: DateTime<Utc>,
    /// Trigger of the reclaim.
    pub reason: ReclaimReason,
    /// Whether the owner solved the challenge.
    pub solved: bool,
    /// Provider termination error that was swallowed, if any.
    pub terminate_error: Option<String>,
}

/// Credentials and launch defaults for the compute provider.
#[derive(Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ProviderConfig {
    /// Provider region.
    pub region: String,
    /// Base URL of the provider API.
    pub endpoint: String,
    /// Access key id.
    pub access_key_id: Option<String>,
    /// Secret access key.
    pub secret_access_key: Option<String>,
    /// Optional session token for temporary credentials.
    pub session_token: Option<String>,
    /// Instance size used when a template leaves it unset.
    pub default_instance_size: Option<String>,
    /// Security group used when a template leaves it unset.
    pub default_security_group: Option<String>,
    /// Subnet used when a template leaves it unset.
    pub default_subnet_id: Option<String>,
    /// Key pair used when a template leaves it unset.
    pub default_key_name: Option<String>,
}

impl ProviderConfig {
    /// Whether both halves of the access key pair are present.
    pub fn has_credentials(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.access_key_id) && present(&self.secret_access_key)
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("ProviderConfig")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redact(&self.secret_access_key))
            .field("session_token", &redact(&self.session_token))
            .field("default_instance_size", &self.default_instance_size)
            .field("default_security_group", &self.default_security_group)
            .field("default_subnet_id", &self.default_subnet_id)
            .field("default_key_name", &self.default_key_name)
            .finish()
    }
}

/// Launch configuration for a compute challenge.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ChallengeTemplate {
    /// Challenge this template belongs to.
    pub challenge_id: String,
    /// Machine image to launch.
    pub image_id: String,
    /// Instance size, falling back to the provider default.
    pub instance_size: Option<String>,
    /// Subnet, falling back to the provider default.
    pub subnet_id: Option<String>,
    /// Security group, falling back to the provider default.
    pub security_group: Option<String>,
    /// Key pair, falling back to the provider default.
    pub key_name: Option<String>,
    /// Script appended to the generated bootstrap payload.
    pub bootstrap_script: String,
    /// How players connect (`http`, `ssh`, ...).
    pub connection_scheme: String,
    /// Port players connect to.
    pub connection_port: Option<i32>,
    /// Lifetime of an instance before automatic reclamation.
    pub max_lifetime_secs: i64,
}

/// Longest lifetime a template may request: one week.
pub const MAX_LIFETIME_SECS: i64 = 7 * 24 * 60 * 60;

impl ChallengeTemplate {
    /// Lifetime as a duration, or `None` when outside `1..=MAX_LIFETIME_SECS`.
    pub fn max_lifetime(&self) -> Option<chrono::TimeDelta> {
        if !(1..=MAX_LIFETIME_SECS).contains(&self.max_lifetime_secs) {
            return None;
        }
        chrono::TimeDelta::try_seconds(self.max_lifetime_secs)
    }

    /// Deadline of an instance launched at `created_at`.
    pub fn deadline_from(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.max_lifetime()
            .and_then(|lifetime| created_at.checked_add_signed(lifetime))
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

/// Raw `instance_records` row. Nullable columns are only filled once active.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct InstanceRow {
    owner_id: String,
    challenge_id: String,
    status: String,
    provider_instance_id: Option<String>,
    secret: Option<String>,
    network_endpoint: Option<String>,
    reserved_at: i64,
    created_at: Option<i64>,
    deadline_at: Option<i64>,
    reclaim_reason: Option<String>,
}

pub(crate) const INSTANCE_COLUMNS: &str = "owner_id, challenge_id, status, provider_instance_id, \
     secret, network_endpoint, reserved_at, created_at, deadline_at, reclaim_reason";

impl InstanceRow {
    pub(crate) fn into_slot(self) -> Result<OwnerSlot, CoreError> {
        let status = RecordStatus::parse(&self.status).ok_or_else(|| CoreError::CorruptRecord {
            owner_id: self.owner_id.clone(),
            reason: format!("unknown status '{}'", self.status),
        })?;

        let reclaim_reason = match self.reclaim_reason.as_deref() {
            None => None,
            Some(value) => Some(ReclaimReason::parse(value).ok_or_else(|| {
                CoreError::CorruptRecord {
                    owner_id: self.owner_id.clone(),
                    reason: format!("unknown reclaim reason '{}'", value),
                }
            })?),
        };

        if status == RecordStatus::Pending {
            return Ok(OwnerSlot::Pending(PendingReservation {
                owner_id: OwnerId::new(self.owner_id),
                challenge_id: self.challenge_id,
                reserved_at: from_unix(self.reserved_at),
            }));
        }

        match (
            self.provider_instance_id,
            self.secret,
            self.created_at,
            self.deadline_at,
        ) {
            (Some(provider_instance_id), Some(secret), Some(created_at), Some(deadline_at)) => {
                Ok(OwnerSlot::Active(InstanceRecord {
                    owner_id: OwnerId::new(self.owner_id),
                    challenge_id: self.challenge_id,
                    status,
                    provider_instance_id,
                    secret,
                    network_endpoint: self.network_endpoint,
                    created_at: from_unix(created_at),
                    deadline_at: from_unix(deadline_at),
                    reclaim_reason,
                }))
            }
            _ => Err(CoreError::CorruptRecord {
                owner_id: self.owner_id,
                reason: format!("{} record is missing launch fields", status.as_str()),
            }),
        }
    }

    pub(crate) fn into_record(self) -> Result<InstanceRecord, CoreError> {
        match self.into_slot()? {
            OwnerSlot::Active(record) => Ok(record),
            OwnerSlot::Pending(pending) => Err(CoreError::CorruptRecord {
                owner_id: pending.owner_id.to_string(),
                reason: "expected a launched record, found a pending reservation".to_string(),
            }),
        }
    }
}

pub(crate) fn rows_into_records(rows: Vec<InstanceRow>) -> Result<Vec<InstanceRecord>, CoreError> {
    rows.into_iter().map(InstanceRow::into_record).collect()
}

/// Raw `instance_history` row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct HistoryRow {
    id: i64,
    owner_id: String,
    challenge_id: String,
    provider_instance_id: String,
    started_at: i64,
    ended_at: i64,
    reason: String,
    solved: bool,
    terminate_error: Option<String>,
}

impl HistoryRow {
    pub(crate) fn into_record(self) -> Result<HistoryRecord, CoreError> {
        let reason = ReclaimReason::parse(&self.reason).ok_or_else(|| CoreError::CorruptRecord {
            owner_id: self.owner_id.clone(),
            reason: format!("unknown reclaim reason '{}'", self.reason),
        })?;
        Ok(HistoryRecord {
            id: self.id,
            owner_id: OwnerId::new(self.owner_id),
            challenge_id: self.challenge_id,
            provider_instance_id: self.provider_instance_id,
            started_at: from_unix(self.started_at),
            ended_at: from_unix(self.ended_at),
            reason,
            solved: self.solved,
            terminate_error: self.terminate_error,
        })
    }
}

pub(crate) fn validate_template(template: &ChallengeTemplate) -> Result<(), CoreError> {
    if template.challenge_id.trim().is_empty() {
        return Err(CoreError::ValidationError {
            field: "challenge_id".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    if template.max_lifetime_secs <= 0 {
        return Err(CoreError::ValidationError {
            field: "max_lifetime_secs".to_string(),
            message: "must be positive".to_string(),
        });
    }
    if template.max_lifetime_secs > MAX_LIFETIME_SECS {
        return Err(CoreError::ValidationError {
            field: "max_lifetime_secs".to_string(),
            message: format!("must not exceed {} seconds", MAX_LIFETIME_SECS),
        });
    }
    Ok(())
}

// ============================================================================
// Store Traits
// ============================================================================

/// Durable owner → instance mapping.
///
/// Every mutation is a single conditional statement (or transaction) so the
/// one-slot-per-owner invariant holds across processes sharing a database.
#[async_trait]
pub trait TrackerStore: Send + Sync {
    /// Insert a pending reservation unless the owner already holds a slot.
    async fn reserve_slot(
        &self,
        owner_id: &OwnerId,
        challenge_id: &str,
        reserved_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome, CoreError>;

    /// Turn the owner's pending reservation into a running record.
    ///
    /// Fails with [`CoreError::ReservationLost`] if the reservation was purged.
    async fn activate_slot(&self, record: &NewInstanceRecord)
    -> Result<InstanceRecord, CoreError>;

    /// Delete the owner's pending reservation. Returns false if there was none.
    async fn release_reservation(&self, owner_id: &OwnerId) -> Result<bool, CoreError>;

    /// Whatever currently occupies the owner's slot.
    async fn get_slot(&self, owner_id: &OwnerId) -> Result<Option<OwnerSlot>, CoreError>;

    /// Launched record holding the given provider handle.
    async fn get_by_provider_id(
        &self,
        provider_instance_id: &str,
    ) -> Result<Option<InstanceRecord>, CoreError>;

    /// Store a newly observed endpoint. Returns false if nothing changed.
    async fn update_endpoint(
        &self,
        provider_instance_id: &str,
        endpoint: &str,
    ) -> Result<bool, CoreError>;

    /// Atomically move a running record to reclaiming, recording `reason`.
    ///
    /// With `expired_at` set, the claim only succeeds when the record's
    /// deadline is at or before that instant. Returns `None` when no running
    /// record matched, including when another caller already claimed it.
    async fn claim_for_reclaim(
        &self,
        selector: &RecordSelector,
        reason: ReclaimReason,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<Option<InstanceRecord>, CoreError>;

    /// Remove a claimed record and append it to the history table.
    async fn finish_reclaim(
        &self,
        record: &InstanceRecord,
        outcome: &ReclaimOutcome,
    ) -> Result<(), CoreError>;

    /// All launched records (running and reclaiming), oldest first.
    async fn list_records(&self) -> Result<Vec<InstanceRecord>, CoreError>;

    /// Running records whose deadline is at or before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<InstanceRecord>, CoreError>;

    /// Records stuck in reclaiming (claimed by a process that never finished).
    async fn list_reclaiming(&self) -> Result<Vec<InstanceRecord>, CoreError>;

    /// Delete pending reservations made before `reserved_before`.
    async fn purge_stale_reservations(
        &self,
        reserved_before: DateTime<Utc>,
    ) -> Result<u64, CoreError>;

    /// Reclaimed instances of an owner, newest first.
    async fn list_history(
        &self,
        owner_id: &OwnerId,
        limit: i64,
    ) -> Result<Vec<HistoryRecord>, CoreError>;

    /// Check that the database answers.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

/// Storage for the provider configuration singleton.
#[async_trait]
pub trait ProviderConfigStore: Send + Sync {
    /// Current configuration, if an administrator has stored one.
    async fn get_provider_config(&self) -> Result<Option<ProviderConfig>, CoreError>;

    /// Create or replace the configuration.
    async fn save_provider_config(&self, config: &ProviderConfig) -> Result<(), CoreError>;
}

/// Read access to challenge launch templates.
#[async_trait]
pub trait TemplateCatalog: Send + Sync {
    /// Template for a challenge.
    async fn get_template(
        &self,
        challenge_id: &str,
    ) -> Result<Option<ChallengeTemplate>, CoreError>;

    /// Create or replace a template.
    async fn save_template(&self, template: &ChallengeTemplate) -> Result<(), CoreError>;
}
