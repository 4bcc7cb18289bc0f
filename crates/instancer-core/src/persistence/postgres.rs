// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Free functions take a `&PgPool` so they can be reused outside the trait
//! object; [`PostgresPersistence`] delegates to them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::CoreError;
use crate::owner::OwnerId;

use super::{
    ChallengeTemplate, HistoryRecord, HistoryRow, INSTANCE_COLUMNS, InstanceRecord, InstanceRow,
    NewInstanceRecord, OwnerSlot, ProviderConfig, ProviderConfigStore, ReclaimOutcome,
    ReclaimReason, RecordSelector, ReserveOutcome, TemplateCatalog, TrackerStore,
    rows_into_records, validate_template,
};

/// How often a reservation is retried when the occupying row vanishes
/// between the insert and the follow-up read.
const RESERVE_ATTEMPTS: usize = 3;

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Borrow the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Owner Slot Operations
// ============================================================================

/// Reserve the owner's slot, or report who holds it.
pub async fn reserve_slot(
    pool: &PgPool,
    owner_id: &OwnerId,
    challenge_id: &str,
    reserved_at: DateTime<Utc>,
) -> Result<ReserveOutcome, CoreError> {
    for _ in 0..RESERVE_ATTEMPTS {
        let inserted = sqlx::query(
            r#"
            INSERT INTO instance_records (owner_id, challenge_id, status, reserved_at)
            VALUES ($1, $2, 'pending', $3)
            ON CONFLICT (owner_id) DO NOTHING
            "#,
        )
        .bind(owner_id.as_str())
        .bind(challenge_id)
        .bind(reserved_at.timestamp())
        .execute(pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(ReserveOutcome::Reserved);
        }

        if let Some(slot) = get_slot(pool, owner_id).await? {
            return Ok(ReserveOutcome::Occupied(slot));
        }
    }

    Err(CoreError::DatabaseError {
        operation: "reserve_slot".to_string(),
        details: format!("slot for owner '{}' kept changing", owner_id),
    })
}

/// Promote the owner's pending reservation to a running record.
pub async fn activate_slot(
    pool: &PgPool,
    record: &NewInstanceRecord,
) -> Result<InstanceRecord, CoreError> {
    let sql = format!(
        r#"
        UPDATE instance_records
        SET status = 'running', provider_instance_id = $2, secret = $3,
            created_at = $4, deadline_at = $5
        WHERE owner_id = $1 AND status = 'pending'
        RETURNING {INSTANCE_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, InstanceRow>(&sql)
        .bind(record.owner_id.as_str())
        .bind(&record.provider_instance_id)
        .bind(&record.secret)
        .bind(record.created_at.timestamp())
        .bind(record.deadline_at.timestamp())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => row.into_record(),
        None => Err(CoreError::ReservationLost {
            owner_id: record.owner_id.to_string(),
        }),
    }
}

/// Drop the owner's pending reservation.
pub async fn release_reservation(pool: &PgPool, owner_id: &OwnerId) -> Result<bool, CoreError> {
    let result =
        sqlx::query("DELETE FROM instance_records WHERE owner_id = $1 AND status = 'pending'")
            .bind(owner_id.as_str())
            .execute(pool)
            .await?;

    Ok(result.rows_affected() > 0)
}

/// Load whatever occupies the owner's slot.
pub async fn get_slot(pool: &PgPool, owner_id: &OwnerId) -> Result<Option<OwnerSlot>, CoreError> {
    let sql = format!("SELECT {INSTANCE_COLUMNS} FROM instance_records WHERE owner_id = $1");
    let row = sqlx::query_as::<_, InstanceRow>(&sql)
        .bind(owner_id.as_str())
        .fetch_optional(pool)
        .await?;

    row.map(InstanceRow::into_slot).transpose()
}

/// Load the launched record holding a provider handle.
pub async fn get_by_provider_id(
    pool: &PgPool,
    provider_instance_id: &str,
) -> Result<Option<InstanceRecord>, CoreError> {
    let sql = format!(
        "SELECT {INSTANCE_COLUMNS} FROM instance_records WHERE provider_instance_id = $1"
    );
    let row = sqlx::query_as::<_, InstanceRow>(&sql)
        .bind(provider_instance_id)
        .fetch_optional(pool)
        .await?;

    row.map(InstanceRow::into_record).transpose()
}

/// Record a new network endpoint for a launched instance.
pub async fn update_endpoint(
    pool: &PgPool,
    provider_instance_id: &str,
    endpoint: &str,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE instance_records
        SET network_endpoint = $2
        WHERE provider_instance_id = $1
          AND (network_endpoint IS NULL OR network_endpoint <> $2)
        "#,
    )
    .bind(provider_instance_id)
    .bind(endpoint)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Reclaim Operations
// ============================================================================

/// Atomically claim a running record for reclamation.
pub async fn claim_for_reclaim(
    pool: &PgPool,
    selector: &RecordSelector,
    reason: ReclaimReason,
    expired_at: Option<DateTime<Utc>>,
) -> Result<Option<InstanceRecord>, CoreError> {
    let (column, key) = match selector {
        RecordSelector::Owner(owner) => ("owner_id", owner.as_str()),
        RecordSelector::ProviderInstance(id) => ("provider_instance_id", id.as_str()),
    };
    let deadline_clause = if expired_at.is_some() {
        "AND deadline_at <= $3"
    } else {
        ""
    };
    let sql = format!(
        r#"
        UPDATE instance_records
        SET status = 'reclaiming', reclaim_reason = $2
        WHERE {column} = $1 AND status = 'running' {deadline_clause}
        RETURNING {INSTANCE_COLUMNS}
        "#
    );

    let mut query = sqlx::query_as::<_, InstanceRow>(&sql)
        .bind(key)
        .bind(reason.as_str());
    if let Some(at) = expired_at {
        query = query.bind(at.timestamp());
    }

    let row = query.fetch_optional(pool).await?;
    row.map(InstanceRow::into_record).transpose()
}

/// Delete a claimed record and write its history row in one transaction.
pub async fn finish_reclaim(
    pool: &PgPool,
    record: &InstanceRecord,
    outcome: &ReclaimOutcome,
) -> Result<(), CoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM instance_records WHERE owner_id = $1 AND provider_instance_id = $2")
        .bind(record.owner_id.as_str())
        .bind(&record.provider_instance_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO instance_history
            (owner_id, challenge_id, provider_instance_id, started_at, ended_at,
             reason, solved, terminate_error)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(record.owner_id.as_str())
    .bind(&record.challenge_id)
    .bind(&record.provider_instance_id)
    .bind(record.created_at.timestamp())
    .bind(outcome.ended_at.timestamp())
    .bind(outcome.reason.as_str())
    .bind(outcome.reason == ReclaimReason::Solved)
    .bind(outcome.terminate_error.as_deref())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Listing
// ============================================================================

/// All launched records, oldest first.
pub async fn list_records(pool: &PgPool) -> Result<Vec<InstanceRecord>, CoreError> {
    let sql = format!(
        r#"
        SELECT {INSTANCE_COLUMNS} FROM instance_records
        WHERE status IN ('running', 'reclaiming')
        ORDER BY created_at ASC, owner_id ASC
        "#
    );
    let rows = sqlx::query_as::<_, InstanceRow>(&sql)
        .fetch_all(pool)
        .await?;
    rows_into_records(rows)
}

/// Running records past their deadline.
pub async fn list_expired(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> Result<Vec<InstanceRecord>, CoreError> {
    let sql = format!(
        r#"
        SELECT {INSTANCE_COLUMNS} FROM instance_records
        WHERE status = 'running' AND deadline_at <= $1
        ORDER BY deadline_at ASC
        "#
    );
    let rows = sqlx::query_as::<_, InstanceRow>(&sql)
        .bind(now.timestamp())
        .fetch_all(pool)
        .await?;
    rows_into_records(rows)
}

/// Records left in reclaiming by an interrupted process.
pub async fn list_reclaiming(pool: &PgPool) -> Result<Vec<InstanceRecord>, CoreError> {
    let sql = format!(
        "SELECT {INSTANCE_COLUMNS} FROM instance_records WHERE status = 'reclaiming' ORDER BY deadline_at ASC"
    );
    let rows = sqlx::query_as::<_, InstanceRow>(&sql)
        .fetch_all(pool)
        .await?;
    rows_into_records(rows)
}

/// Delete pending reservations older than the cutoff.
pub async fn purge_stale_reservations(
    pool: &PgPool,
    reserved_before: DateTime<Utc>,
) -> Result<u64, CoreError> {
    let result = sqlx::query(
        "DELETE FROM instance_records WHERE status = 'pending' AND reserved_at < $1",
    )
    .bind(reserved_before.timestamp())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Reclaimed instances of an owner, newest first.
pub async fn list_history(
    pool: &PgPool,
    owner_id: &OwnerId,
    limit: i64,
) -> Result<Vec<HistoryRecord>, CoreError> {
    let rows = sqlx::query_as::<_, HistoryRow>(
        r#"
        SELECT id, owner_id, challenge_id, provider_instance_id, started_at, ended_at,
               reason, solved, terminate_error
        FROM instance_history
        WHERE owner_id = $1
        ORDER BY ended_at DESC, id DESC
        LIMIT $2
        "#,
    )
    .bind(owner_id.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(HistoryRow::into_record).collect()
}

/// Check database connectivity.
pub async fn health_check_db(pool: &PgPool) -> Result<bool, CoreError> {
    let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(pool).await;
    Ok(result.is_ok())
}

// ============================================================================
// Provider Config & Templates
// ============================================================================

/// Load the provider configuration singleton.
pub async fn get_provider_config(pool: &PgPool) -> Result<Option<ProviderConfig>, CoreError> {
    let config = sqlx::query_as::<_, ProviderConfig>(
        r#"
        SELECT region, endpoint, access_key_id, secret_access_key, session_token,
               default_instance_size, default_security_group, default_subnet_id,
               default_key_name
        FROM provider_config
        WHERE id = 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(config)
}

/// Create or replace the provider configuration singleton.
pub async fn save_provider_config(pool: &PgPool, config: &ProviderConfig) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO provider_config
            (id, region, endpoint, access_key_id, secret_access_key, session_token,
             default_instance_size, default_security_group, default_subnet_id,
             default_key_name, updated_at)
        VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE SET
            region = EXCLUDED.region,
            endpoint = EXCLUDED.endpoint,
            access_key_id = EXCLUDED.access_key_id,
            secret_access_key = EXCLUDED.secret_access_key,
            session_token = EXCLUDED.session_token,
            default_instance_size = EXCLUDED.default_instance_size,
            default_security_group = EXCLUDED.default_security_group,
            default_subnet_id = EXCLUDED.default_subnet_id,
            default_key_name = EXCLUDED.default_key_name,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&config.region)
    .bind(&config.endpoint)
    .bind(&config.access_key_id)
    .bind(&config.secret_access_key)
    .bind(&config.session_token)
    .bind(&config.default_instance_size)
    .bind(&config.default_security_group)
    .bind(&config.default_subnet_id)
    .bind(&config.default_key_name)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load a challenge template.
pub async fn get_template(
    pool: &PgPool,
    challenge_id: &str,
) -> Result<Option<ChallengeTemplate>, CoreError> {
    let template = sqlx::query_as::<_, ChallengeTemplate>(
        r#"
        SELECT challenge_id, image_id, instance_size, subnet_id, security_group, key_name,
               bootstrap_script, connection_scheme, connection_port, max_lifetime_secs
        FROM challenge_templates
        WHERE challenge_id = $1
        "#,
    )
    .bind(challenge_id)
    .fetch_optional(pool)
    .await?;

    Ok(template)
}

/// Create or replace a challenge template.
pub async fn save_template(pool: &PgPool, template: &ChallengeTemplate) -> Result<(), CoreError> {
    validate_template(template)?;

    sqlx::query(
        r#"
        INSERT INTO challenge_templates
            (challenge_id, image_id, instance_size, subnet_id, security_group, key_name,
             bootstrap_script, connection_scheme, connection_port, max_lifetime_secs)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (challenge_id) DO UPDATE SET
            image_id = EXCLUDED.image_id,
            instance_size = EXCLUDED.instance_size,
            subnet_id = EXCLUDED.subnet_id,
            security_group = EXCLUDED.security_group,
            key_name = EXCLUDED.key_name,
            bootstrap_script = EXCLUDED.bootstrap_script,
            connection_scheme = EXCLUDED.connection_scheme,
            connection_port = EXCLUDED.connection_port,
            max_lifetime_secs = EXCLUDED.max_lifetime_secs
        "#,
    )
    .bind(&template.challenge_id)
    .bind(&template.image_id)
    .bind(&template.instance_size)
    .bind(&template.subnet_id)
    .bind(&template.security_group)
    .bind(&template.key_name)
    .bind(&template.bootstrap_script)
    .bind(&template.connection_scheme)
    .bind(template.connection_port)
    .bind(template.max_lifetime_secs)
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Trait Implementations
// ============================================================================

#[async_trait]
impl TrackerStore for PostgresPersistence {
    async fn reserve_slot(
        &self,
        owner_id: &OwnerId,
        challenge_id: &str,
        reserved_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome, CoreError> {
        reserve_slot(&self.pool, owner_id, challenge_id, reserved_at).await
    }

    async fn activate_slot(
        &self,
        record: &NewInstanceRecord,
    ) -> Result<InstanceRecord, CoreError> {
        activate_slot(&self.pool, record).await
    }

    async fn release_reservation(&self, owner_id: &OwnerId) -> Result<bool, CoreError> {
        release_reservation(&self.pool, owner_id).await
    }

    async fn get_slot(&self, owner_id: &OwnerId) -> Result<Option<OwnerSlot>, CoreError> {
        get_slot(&self.pool, owner_id).await
    }

    async fn get_by_provider_id(
        &self,
        provider_instance_id: &str,
    ) -> Result<Option<InstanceRecord>, CoreError> {
        get_by_provider_id(&self.pool, provider_instance_id).await
    }

    async fn update_endpoint(
        &self,
        provider_instance_id: &str,
        endpoint: &str,
    ) -> Result<bool, CoreError> {
        update_endpoint(&self.pool, provider_instance_id, endpoint).await
    }

    async fn claim_for_reclaim(
        &self,
        selector: &RecordSelector,
        reason: ReclaimReason,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<Option<InstanceRecord>, CoreError> {
        claim_for_reclaim(&self.pool, selector, reason, expired_at).await
    }

    async fn finish_reclaim(
        &self,
        record: &InstanceRecord,
        outcome: &ReclaimOutcome,
    ) -> Result<(), CoreError> {
        finish_reclaim(&self.pool, record, outcome).await
    }

    async fn list_records(&self) -> Result<Vec<InstanceRecord>, CoreError> {
        list_records(&self.pool).await
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<InstanceRecord>, CoreError> {
        list_expired(&self.pool, now).await
    }

    async fn list_reclaiming(&self) -> Result<Vec<InstanceRecord>, CoreError> {
        list_reclaiming(&self.pool).await
    }

    async fn purge_stale_reservations(
        &self,
        reserved_before: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        purge_stale_reservations(&self.pool, reserved_before).await
    }

    async fn list_history(
        &self,
        owner_id: &OwnerId,
        limit: i64,
    ) -> Result<Vec<HistoryRecord>, CoreError> {
        list_history(&self.pool, owner_id, limit).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        health_check_db(&self.pool).await
    }
}

#[async_trait]
impl ProviderConfigStore for PostgresPersistence {
    async fn get_provider_config(&self) -> Result<Option<ProviderConfig>, CoreError> {
        get_provider_config(&self.pool).await
    }

    async fn save_provider_config(&self, config: &ProviderConfig) -> Result<(), CoreError> {
        save_provider_config(&self.pool, config).await
    }
}

#[async_trait]
impl TemplateCatalog for PostgresPersistence {
    async fn get_template(
        &self,
        challenge_id: &str,
    ) -> Result<Option<ChallengeTemplate>, CoreError> {
        get_template(&self.pool, challenge_id).await
    }

    async fn save_template(&self, template: &ChallengeTemplate) -> Result<(), CoreError> {
        save_template(&self.pool, template).await
    }
}
