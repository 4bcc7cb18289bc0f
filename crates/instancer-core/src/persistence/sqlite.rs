// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;
use crate::owner::OwnerId;

use super::{
    ChallengeTemplate, HistoryRecord, HistoryRow, INSTANCE_COLUMNS, InstanceRecord, InstanceRow,
    NewInstanceRecord, OwnerSlot, ProviderConfig, ProviderConfigStore, ReclaimOutcome,
    ReclaimReason, RecordSelector, ReserveOutcome, TemplateCatalog, TrackerStore,
    rows_into_records, validate_template,
};

const RESERVE_ATTEMPTS: usize = 3;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a SQLite persistence from a file path.
    ///
    /// Creates missing parent directories and the database file, then runs
    /// all migrations.
    ///
    /// ```ignore
    /// let store = SqlitePersistence::from_path(".data/instancer.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// Borrow the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TrackerStore for SqlitePersistence {
    async fn reserve_slot(
        &self,
        owner_id: &OwnerId,
        challenge_id: &str,
        reserved_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome, CoreError> {
        for _ in 0..RESERVE_ATTEMPTS {
            let inserted = sqlx::query(
                r#"
                INSERT INTO instance_records (owner_id, challenge_id, status, reserved_at)
                VALUES (?, ?, 'pending', ?)
                ON CONFLICT (owner_id) DO NOTHING
                "#,
            )
            .bind(owner_id.as_str())
            .bind(challenge_id)
            .bind(reserved_at.timestamp())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if inserted == 1 {
                return Ok(ReserveOutcome::Reserved);
            }

            if let Some(slot) = self.get_slot(owner_id).await? {
                return Ok(ReserveOutcome::Occupied(slot));
            }
        }

        Err(CoreError::DatabaseError {
            operation: "reserve_slot".to_string(),
            details: format!("slot for owner '{}' kept changing", owner_id),
        })
    }

    async fn activate_slot(
        &self,
        record: &NewInstanceRecord,
    ) -> Result<InstanceRecord, CoreError> {
        let sql = format!(
            r#"
            UPDATE instance_records
            SET status = 'running', provider_instance_id = ?, secret = ?,
                created_at = ?, deadline_at = ?
            WHERE owner_id = ? AND status = 'pending'
            RETURNING {INSTANCE_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(&record.provider_instance_id)
            .bind(&record.secret)
            .bind(record.created_at.timestamp())
            .bind(record.deadline_at.timestamp())
            .bind(record.owner_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.into_record(),
            None => Err(CoreError::ReservationLost {
                owner_id: record.owner_id.to_string(),
            }),
        }
    }

    async fn release_reservation(&self, owner_id: &OwnerId) -> Result<bool, CoreError> {
        let result =
            sqlx::query("DELETE FROM instance_records WHERE owner_id = ? AND status = 'pending'")
                .bind(owner_id.as_str())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_slot(&self, owner_id: &OwnerId) -> Result<Option<OwnerSlot>, CoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM instance_records WHERE owner_id = ?");
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(owner_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(InstanceRow::into_slot).transpose()
    }

    async fn get_by_provider_id(
        &self,
        provider_instance_id: &str,
    ) -> Result<Option<InstanceRecord>, CoreError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM instance_records WHERE provider_instance_id = ?"
        );
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(provider_instance_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(InstanceRow::into_record).transpose()
    }

    async fn update_endpoint(
        &self,
        provider_instance_id: &str,
        endpoint: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE instance_records
            SET network_endpoint = ?
            WHERE provider_instance_id = ?
              AND (network_endpoint IS NULL OR network_endpoint <> ?)
            "#,
        )
        .bind(endpoint)
        .bind(provider_instance_id)
        .bind(endpoint)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_for_reclaim(
        &self,
        selector: &RecordSelector,
        reason: ReclaimReason,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<Option<InstanceRecord>, CoreError> {
        let (column, key) = match selector {
            RecordSelector::Owner(owner) => ("owner_id", owner.as_str()),
            RecordSelector::ProviderInstance(id) => ("provider_instance_id", id.as_str()),
        };
        let deadline_clause = if expired_at.is_some() {
            "AND deadline_at <= ?"
        } else {
            ""
        };
        let sql = format!(
            r#"
            UPDATE instance_records
            SET status = 'reclaiming', reclaim_reason = ?
            WHERE {column} = ? AND status = 'running' {deadline_clause}
            RETURNING {INSTANCE_COLUMNS}
            "#
        );

        let mut query = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(reason.as_str())
            .bind(key);
        if let Some(at) = expired_at {
            query = query.bind(at.timestamp());
        }

        let row = query.fetch_optional(&self.pool).await?;
        row.map(InstanceRow::into_record).transpose()
    }

    async fn finish_reclaim(
        &self,
        record: &InstanceRecord,
        outcome: &ReclaimOutcome,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM instance_records WHERE owner_id = ? AND provider_instance_id = ?")
            .bind(record.owner_id.as_str())
            .bind(&record.provider_instance_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO instance_history
                (owner_id, challenge_id, provider_instance_id, started_at, ended_at,
                 reason, solved, terminate_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
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

    async fn list_records(&self) -> Result<Vec<InstanceRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {INSTANCE_COLUMNS} FROM instance_records
            WHERE status IN ('running', 'reclaiming')
            ORDER BY created_at ASC, owner_id ASC
            "#
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows_into_records(rows)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<InstanceRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {INSTANCE_COLUMNS} FROM instance_records
            WHERE status = 'running' AND deadline_at <= ?
            ORDER BY deadline_at ASC
            "#
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(now.timestamp())
            .fetch_all(&self.pool)
            .await?;
        rows_into_records(rows)
    }

    async fn list_reclaiming(&self) -> Result<Vec<InstanceRecord>, CoreError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM instance_records WHERE status = 'reclaiming' ORDER BY deadline_at ASC"
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows_into_records(rows)
    }

    async fn purge_stale_reservations(
        &self,
        reserved_before: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let result =
            sqlx::query("DELETE FROM instance_records WHERE status = 'pending' AND reserved_at < ?")
                .bind(reserved_before.timestamp())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    async fn list_history(
        &self,
        owner_id: &OwnerId,
        limit: i64,
    ) -> Result<Vec<HistoryRecord>, CoreError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, owner_id, challenge_id, provider_instance_id, started_at, ended_at,
                   reason, solved, terminate_error
            FROM instance_history
            WHERE owner_id = ?
            ORDER BY ended_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(owner_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(HistoryRow::into_record).collect()
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

#[async_trait]
impl ProviderConfigStore for SqlitePersistence {
    async fn get_provider_config(&self) -> Result<Option<ProviderConfig>, CoreError> {
        let config = sqlx::query_as::<_, ProviderConfig>(
            r#"
            SELECT region, endpoint, access_key_id, secret_access_key, session_token,
                   default_instance_size, default_security_group, default_subnet_id,
                   default_key_name
            FROM provider_config
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(config)
    }

    async fn save_provider_config(&self, config: &ProviderConfig) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO provider_config
                (id, region, endpoint, access_key_id, secret_access_key, session_token,
                 default_instance_size, default_security_group, default_subnet_id,
                 default_key_name, updated_at)
            VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                region = excluded.region,
                endpoint = excluded.endpoint,
                access_key_id = excluded.access_key_id,
                secret_access_key = excluded.secret_access_key,
                session_token = excluded.session_token,
                default_instance_size = excluded.default_instance_size,
                default_security_group = excluded.default_security_group,
                default_subnet_id = excluded.default_subnet_id,
                default_key_name = excluded.default_key_name,
                updated_at = excluded.updated_at
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
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TemplateCatalog for SqlitePersistence {
    async fn get_template(
        &self,
        challenge_id: &str,
    ) -> Result<Option<ChallengeTemplate>, CoreError> {
        let template = sqlx::query_as::<_, ChallengeTemplate>(
            r#"
            SELECT challenge_id, image_id, instance_size, subnet_id, security_group, key_name,
                   bootstrap_script, connection_scheme, connection_port, max_lifetime_secs
            FROM challenge_templates
            WHERE challenge_id = ?
            "#,
        )
        .bind(challenge_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(template)
    }

    async fn save_template(&self, template: &ChallengeTemplate) -> Result<(), CoreError> {
        validate_template(template)?;

        sqlx::query(
            r#"
            INSERT INTO challenge_templates
                (challenge_id, image_id, instance_size, subnet_id, security_group, key_name,
                 bootstrap_script, connection_scheme, connection_port, max_lifetime_secs)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (challenge_id) DO UPDATE SET
                image_id = excluded.image_id,
                instance_size = excluded.instance_size,
                subnet_id = excluded.subnet_id,
                security_group = excluded.security_group,
                key_name = excluded.key_name,
                bootstrap_script = excluded.bootstrap_script,
                connection_scheme = excluded.connection_scheme,
                connection_port = excluded.connection_port,
                max_lifetime_secs = excluded.max_lifetime_secs
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
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_unix;
    use crate::persistence::RecordStatus;

    /// Create an in-memory SQLite pool for testing.
    async fn test_store() -> SqlitePersistence {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        SqlitePersistence::new(pool)
    }

    fn new_record(owner: &str, instance_id: &str, created: i64, deadline: i64) -> NewInstanceRecord {
        NewInstanceRecord {
            owner_id: OwnerId::from(owner),
            provider_instance_id: instance_id.to_string(),
            secret: "K7Q2M9XW4RZT8BNC".to_string(),
            created_at: from_unix(created),
            deadline_at: from_unix(deadline),
        }
    }

    async fn running(store: &SqlitePersistence, owner: &str, instance_id: &str, deadline: i64) {
        let owner_id = OwnerId::from(owner);
        store
            .reserve_slot(&owner_id, "web-1", from_unix(1000))
            .await
            .unwrap();
        store
            .activate_slot(&new_record(owner, instance_id, 1000, deadline))
            .await
            .unwrap();
    }

    fn timeout_at(secs: i64) -> ReclaimOutcome {
        ReclaimOutcome {
            reason: ReclaimReason::Timeout,
            ended_at: from_unix(secs),
            terminate_error: None,
        }
    }

    #[tokio::test]
    async fn test_reserve_then_occupied() {
        let store = test_store().await;
        let owner = OwnerId::from("u1");

        let first = store
            .reserve_slot(&owner, "web-1", from_unix(1000))
            .await
            .unwrap();
        assert_eq!(first, ReserveOutcome::Reserved);

        let second = store
            .reserve_slot(&owner, "web-2", from_unix(1001))
            .await
            .unwrap();
        match second {
            ReserveOutcome::Occupied(slot) => {
                assert_eq!(slot.status(), RecordStatus::Pending);
                assert_eq!(slot.challenge_id(), "web-1");
            }
            other => panic!("expected occupied slot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_activate_sets_running_fields() {
        let store = test_store().await;
        running(&store, "u1", "i-abc", 2800).await;

        let slot = store.get_slot(&OwnerId::from("u1")).await.unwrap().unwrap();
        let OwnerSlot::Active(record) = slot else {
            panic!("expected active slot");
        };
        assert_eq!(record.status, RecordStatus::Running);
        assert_eq!(record.provider_instance_id, "i-abc");
        assert_eq!(record.created_at.timestamp(), 1000);
        assert_eq!(record.deadline_at.timestamp(), 2800);
        assert!(record.network_endpoint.is_none());
    }

    #[tokio::test]
    async fn test_activate_without_reservation_is_lost() {
        let store = test_store().await;

        let err = store
            .activate_slot(&new_record("ghost", "i-1", 1000, 2800))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RESERVATION_LOST");
    }

    #[tokio::test]
    async fn test_release_only_drops_pending() {
        let store = test_store().await;
        running(&store, "u1", "i-1", 2800).await;

        assert!(!store.release_reservation(&OwnerId::from("u1")).await.unwrap());
        assert!(store.get_slot(&OwnerId::from("u1")).await.unwrap().is_some());

        store
            .reserve_slot(&OwnerId::from("u2"), "web-1", from_unix(1000))
            .await
            .unwrap();
        assert!(store.release_reservation(&OwnerId::from("u2")).await.unwrap());
        assert!(store.get_slot(&OwnerId::from("u2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_deadline() {
        let store = test_store().await;
        running(&store, "u1", "i-1", 2800).await;
        let selector = RecordSelector::Owner(OwnerId::from("u1"));

        let early = store
            .claim_for_reclaim(&selector, ReclaimReason::Timeout, Some(from_unix(2799)))
            .await
            .unwrap();
        assert!(early.is_none());

        let claimed = store
            .claim_for_reclaim(&selector, ReclaimReason::Timeout, Some(from_unix(2800)))
            .await
            .unwrap()
            .expect("claim at deadline should succeed");
        assert_eq!(claimed.status, RecordStatus::Reclaiming);
        assert_eq!(claimed.reclaim_reason, Some(ReclaimReason::Timeout));
    }

    #[tokio::test]
    async fn test_claim_only_once() {
        let store = test_store().await;
        running(&store, "u1", "i-1", 2800).await;
        let selector = RecordSelector::ProviderInstance("i-1".to_string());

        let reason = ReclaimReason::AdminTerminate;
        assert!(store.claim_for_reclaim(&selector, reason, None).await.unwrap().is_some());
        assert!(store.claim_for_reclaim(&selector, reason, None).await.unwrap().is_none());

        let stuck = store.list_reclaiming().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].reclaim_reason, Some(ReclaimReason::AdminTerminate));
    }

    #[tokio::test]
    async fn test_finish_reclaim_moves_record_to_history() {
        let store = test_store().await;
        running(&store, "u1", "i-1", 2800).await;

        let claimed = store
            .claim_for_reclaim(
                &RecordSelector::Owner(OwnerId::from("u1")),
                ReclaimReason::Solved,
                None,
            )
            .await
            .unwrap()
            .unwrap();
        store
            .finish_reclaim(
                &claimed,
                &ReclaimOutcome {
                    reason: ReclaimReason::Solved,
                    ended_at: from_unix(1500),
                    terminate_error: Some("provider unavailable".to_string()),
                },
            )
            .await
            .unwrap();

        assert!(store.get_slot(&OwnerId::from("u1")).await.unwrap().is_none());
        assert!(store.get_by_provider_id("i-1").await.unwrap().is_none());

        let history = store.list_history(&OwnerId::from("u1"), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, ReclaimReason::Solved);
        assert!(history[0].solved);
        assert_eq!(history[0].started_at.timestamp(), 1000);
        assert_eq!(history[0].ended_at.timestamp(), 1500);
        assert_eq!(
            history[0].terminate_error.as_deref(),
            Some("provider unavailable")
        );
    }

    #[tokio::test]
    async fn test_owner_can_reallocate_after_reclaim() {
        let store = test_store().await;
        running(&store, "u1", "i-1", 2800).await;

        let claimed = store
            .claim_for_reclaim(
                &RecordSelector::Owner(OwnerId::from("u1")),
                ReclaimReason::Solved,
                None,
            )
            .await
            .unwrap()
            .unwrap();
        store.finish_reclaim(&claimed, &timeout_at(2800)).await.unwrap();

        let outcome = store
            .reserve_slot(&OwnerId::from("u1"), "web-2", from_unix(3000))
            .await
            .unwrap();
        assert_eq!(outcome, ReserveOutcome::Reserved);
    }

    #[tokio::test]
    async fn test_list_expired_is_inclusive() {
        let store = test_store().await;
        running(&store, "u1", "i-1", 2800).await;
        running(&store, "u2", "i-2", 2900).await;

        let expired = store.list_expired(from_unix(2800)).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].provider_instance_id, "i-1");

        assert_eq!(store.list_expired(from_unix(2900)).await.unwrap().len(), 2);
        assert_eq!(store.list_records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_reservations_are_not_listed() {
        let store = test_store().await;
        running(&store, "u1", "i-1", 2800).await;
        store
            .reserve_slot(&OwnerId::from("u2"), "web-1", from_unix(1000))
            .await
            .unwrap();

        assert_eq!(store.list_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_stale_reservations() {
        let store = test_store().await;
        store
            .reserve_slot(&OwnerId::from("old"), "web-1", from_unix(100))
            .await
            .unwrap();
        store
            .reserve_slot(&OwnerId::from("new"), "web-1", from_unix(900))
            .await
            .unwrap();
        running(&store, "u1", "i-1", 2800).await;

        let purged = store.purge_stale_reservations(from_unix(500)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_slot(&OwnerId::from("old")).await.unwrap().is_none());
        assert!(store.get_slot(&OwnerId::from("new")).await.unwrap().is_some());
        assert!(store.get_slot(&OwnerId::from("u1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_endpoint_reports_change() {
        let store = test_store().await;
        running(&store, "u1", "i-1", 2800).await;

        assert!(store.update_endpoint("i-1", "10.0.0.5").await.unwrap());
        assert!(!store.update_endpoint("i-1", "10.0.0.5").await.unwrap());
        assert!(store.update_endpoint("i-1", "10.0.0.6").await.unwrap());
        assert!(!store.update_endpoint("i-missing", "10.0.0.7").await.unwrap());

        let record = store.get_by_provider_id("i-1").await.unwrap().unwrap();
        assert_eq!(record.network_endpoint.as_deref(), Some("10.0.0.6"));
    }

    #[tokio::test]
    async fn test_provider_config_upsert() {
        let store = test_store().await;
        assert!(store.get_provider_config().await.unwrap().is_none());

        let mut config = ProviderConfig {
            region: "eu-north-1".to_string(),
            endpoint: "https://compute.example".to_string(),
            access_key_id: Some("AKIA".to_string()),
            secret_access_key: Some("secret".to_string()),
            session_token: None,
            default_instance_size: Some("small".to_string()),
            default_security_group: None,
            default_subnet_id: None,
            default_key_name: None,
        };
        store.save_provider_config(&config).await.unwrap();

        config.region = "us-east-1".to_string();
        store.save_provider_config(&config).await.unwrap();

        let stored = store.get_provider_config().await.unwrap().unwrap();
        assert_eq!(stored, config);
    }

    #[tokio::test]
    async fn test_template_save_and_validate() {
        let store = test_store().await;
        let mut template = ChallengeTemplate {
            challenge_id: "web-1".to_string(),
            image_id: "img-123".to_string(),
            instance_size: None,
            subnet_id: None,
            security_group: None,
            key_name: None,
            bootstrap_script: "systemctl start app".to_string(),
            connection_scheme: "http".to_string(),
            connection_port: Some(8080),
            max_lifetime_secs: 1800,
        };
        store.save_template(&template).await.unwrap();

        let stored = store.get_template("web-1").await.unwrap().unwrap();
        assert_eq!(stored, template);
        assert!(store.get_template("web-2").await.unwrap().is_none());

        template.max_lifetime_secs = 0;
        let err = store.save_template(&template).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        template.max_lifetime_secs = 10_000_000_000_000;
        let err = store.save_template(&template).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert_eq!(
            store.get_template("web-1").await.unwrap().unwrap().max_lifetime_secs,
            1800
        );
    }

    #[tokio::test]
    async fn test_health_check_db() {
        let store = test_store().await;
        assert!(store.health_check_db().await.unwrap());
    }
}
