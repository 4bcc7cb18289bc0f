// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for instancer-environment tests.
//!
//! Provides TestContext wiring an in-memory SQLite store, the mock gateway
//! and a manual clock into a lifecycle manager. The manager sees the tracker
//! store through [`FaultyStore`], so tests can make record removal fail.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use instancer_core::persistence::{
    ChallengeTemplate, HistoryRecord, InstanceRecord, NewInstanceRecord, OwnerSlot,
    ProviderConfig, ProviderConfigStore, ReclaimOutcome, ReclaimReason, RecordSelector,
    ReserveOutcome, SqlitePersistence, TemplateCatalog, TrackerStore,
};
use instancer_core::{CoreError, ManualClock, OwnerId};
use sqlx::sqlite::SqlitePoolOptions;

use instancer_environment::gateway::MockGateway;
use instancer_environment::lifecycle::LifecycleManager;

/// Time every test starts at.
pub const START: i64 = 1000;

/// Challenge with an 1800 second lifetime.
pub const WEB: &str = "web-1";

/// Challenge with a 600 second lifetime.
pub const PWN: &str = "pwn-2";

/// Test context for lifecycle tests.
pub struct TestContext {
    pub store: Arc<SqlitePersistence>,
    pub faults: Arc<FaultyStore>,
    pub gateway: Arc<MockGateway>,
    pub clock: Arc<ManualClock>,
    pub manager: Arc<LifecycleManager>,
}

impl TestContext {
    /// Context with a configured provider and both templates stored.
    pub async fn new() -> Self {
        Self::with_gateway(MockGateway::new()).await
    }

    /// Context using a pre-configured mock gateway.
    pub async fn with_gateway(gateway: MockGateway) -> Self {
        let ctx = Self::empty_with_gateway(gateway).await;
        ctx.store
            .save_provider_config(&provider_config())
            .await
            .expect("Failed to save provider config");
        ctx.store
            .save_template(&template(WEB, 1800))
            .await
            .expect("Failed to save template");
        ctx.store
            .save_template(&template(PWN, 600))
            .await
            .expect("Failed to save template");
        ctx
    }

    /// Context with nothing stored.
    pub async fn empty() -> Self {
        Self::empty_with_gateway(MockGateway::new()).await
    }

    async fn empty_with_gateway(gateway: MockGateway) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        instancer_core::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        let store = Arc::new(SqlitePersistence::new(pool));
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let gateway = Arc::new(gateway);
        let clock = Arc::new(ManualClock::at(START));

        let manager = LifecycleManager::new(
            faults.clone(),
            store.clone(),
            store.clone(),
            gateway.clone(),
        )
        .with_clock(clock.clone());

        Self {
            store,
            faults,
            gateway,
            clock,
            manager: Arc::new(manager),
        }
    }

    /// The secret bound to an instance.
    pub async fn secret_of(&self, provider_instance_id: &str) -> String {
        self.store
            .get_by_provider_id(provider_instance_id)
            .await
            .expect("Failed to read record")
            .expect("Record missing")
            .secret
    }

    /// Number of launched records held by `owner`.
    pub async fn record_count(&self, owner: &str) -> usize {
        let owner = OwnerId::from(owner);
        self.store
            .list_records()
            .await
            .expect("Failed to list records")
            .iter()
            .filter(|r| r.owner_id == owner)
            .count()
    }
}

pub fn provider_config() -> ProviderConfig {
    ProviderConfig {
        region: "mock-1".to_string(),
        endpoint: "http://mock".to_string(),
        access_key_id: Some("AKIAMOCK".to_string()),
        secret_access_key: Some("mock-secret".to_string()),
        session_token: None,
        default_instance_size: Some("small".to_string()),
        default_security_group: Some("sg-ctf".to_string()),
        default_subnet_id: Some("subnet-ctf".to_string()),
        default_key_name: None,
    }
}

pub fn template(challenge_id: &str, max_lifetime_secs: i64) -> ChallengeTemplate {
    ChallengeTemplate {
        challenge_id: challenge_id.to_string(),
        image_id: format!("img-{}", challenge_id),
        instance_size: None,
        subnet_id: None,
        security_group: None,
        key_name: None,
        bootstrap_script: "systemctl start challenge".to_string(),
        connection_scheme: "http".to_string(),
        connection_port: Some(8080),
        max_lifetime_secs,
    }
}

/// Tracker store that delegates to SQLite but can fail `finish_reclaim`.
pub struct FaultyStore {
    inner: Arc<SqlitePersistence>,
    failing_finishes: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<SqlitePersistence>) -> Self {
        Self {
            inner,
            failing_finishes: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` calls to `finish_reclaim` fail.
    pub fn fail_next_finishes(&self, count: usize) {
        self.failing_finishes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrackerStore for FaultyStore {
    async fn reserve_slot(
        &self,
        owner_id: &OwnerId,
        challenge_id: &str,
        reserved_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome, CoreError> {
        self.inner
            .reserve_slot(owner_id, challenge_id, reserved_at)
            .await
    }

    async fn activate_slot(
        &self,
        record: &NewInstanceRecord,
    ) -> Result<InstanceRecord, CoreError> {
        self.inner.activate_slot(record).await
    }

    async fn release_reservation(&self, owner_id: &OwnerId) -> Result<bool, CoreError> {
        self.inner.release_reservation(owner_id).await
    }

    async fn get_slot(&self, owner_id: &OwnerId) -> Result<Option<OwnerSlot>, CoreError> {
        self.inner.get_slot(owner_id).await
    }

    async fn get_by_provider_id(
        &self,
        provider_instance_id: &str,
    ) -> Result<Option<InstanceRecord>, CoreError> {
        self.inner.get_by_provider_id(provider_instance_id).await
    }

    async fn update_endpoint(
        &self,
        provider_instance_id: &str,
        endpoint: &str,
    ) -> Result<bool, CoreError> {
        self.inner
            .update_endpoint(provider_instance_id, endpoint)
            .await
    }

    async fn claim_for_reclaim(
        &self,
        selector: &RecordSelector,
        reason: ReclaimReason,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<Option<InstanceRecord>, CoreError> {
        self.inner
            .claim_for_reclaim(selector, reason, expired_at)
            .await
    }

    async fn finish_reclaim(
        &self,
        record: &InstanceRecord,
        outcome: &ReclaimOutcome,
    ) -> Result<(), CoreError> {
        let failed = self
            .failing_finishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CoreError::DatabaseError {
                operation: "finish_reclaim".to_string(),
                details: "database is locked".to_string(),
            });
        }
        self.inner.finish_reclaim(record, outcome).await
    }

    async fn list_records(&self) -> Result<Vec<InstanceRecord>, CoreError> {
        self.inner.list_records().await
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<InstanceRecord>, CoreError> {
        self.inner.list_expired(now).await
    }

    async fn list_reclaiming(&self) -> Result<Vec<InstanceRecord>, CoreError> {
        self.inner.list_reclaiming().await
    }

    async fn purge_stale_reservations(
        &self,
        reserved_before: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        self.inner.purge_stale_reservations(reserved_before).await
    }

    async fn list_history(
        &self,
        owner_id: &OwnerId,
        limit: i64,
    ) -> Result<Vec<HistoryRecord>, CoreError> {
        self.inner.list_history(owner_id, limit).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        self.inner.health_check_db().await
    }
}
