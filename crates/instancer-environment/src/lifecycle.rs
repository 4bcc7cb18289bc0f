// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle manager.
//!
//! Owns every state transition of an owner's instance:
//!
//! ```text
//!   NONE ──allocate──▶ PENDING ──launch ok──▶ RUNNING ──reclaim──▶ RECLAIMING ──▶ NONE
//!                         │
//!                         └──launch failed──▶ NONE
//! ```
//!
//! Mutual exclusion comes entirely from the tracker store: the reservation is
//! an atomic insert-if-absent keyed by owner, and a reclaim only proceeds for
//! the caller whose conditional `RUNNING → RECLAIMING` update succeeded.
//! Different owners never contend.
//!
//! A reclaim whose record removal fails after termination stays queued in
//! the manager; [`LifecycleManager::retry_deferred`] finishes it later. A
//! process restart loses the queue, so startup resumes every record still
//! marked reclaiming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use instancer_core::persistence::{
    ChallengeTemplate, HistoryRecord, InstanceRecord, MAX_LIFETIME_SECS, NewInstanceRecord,
    OwnerSlot, ProviderConfig, ProviderConfigStore, ReclaimOutcome, ReclaimReason,
    RecordSelector, RecordStatus, ReserveOutcome, TemplateCatalog, TrackerStore,
};
use instancer_core::{Clock, OwnerId, SystemClock};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::LifecycleError;
use crate::gateway::{ComputeGateway, GatewayError, LaunchRequest, Launchables};
use crate::secret::{SecretPolicy, bootstrap_payload, secrets_match};

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Identity of the caller, as established by the platform's session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    /// Owner the caller acts as.
    pub owner_id: OwnerId,
    /// Whether the caller has administrative rights.
    pub is_admin: bool,
}

impl Requester {
    /// A regular participant.
    pub fn owner(owner_id: impl Into<OwnerId>) -> Self {
        Self {
            owner_id: owner_id.into(),
            is_admin: false,
        }
    }

    /// An administrator.
    pub fn admin(owner_id: impl Into<OwnerId>) -> Self {
        Self {
            owner_id: owner_id.into(),
            is_admin: true,
        }
    }

    /// Whether the caller may act on a record owned by `owner_id`.
    pub fn may_access(&self, owner_id: &OwnerId) -> bool {
        self.is_admin || &self.owner_id == owner_id
    }
}

/// A freshly launched instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    /// Provider handle.
    pub provider_instance_id: String,
    /// Challenge launched.
    pub challenge_id: String,
    /// Launch time.
    pub created_at: DateTime<Utc>,
    /// Automatic reclamation deadline.
    pub deadline_at: DateTime<Utc>,
    /// How to connect once the instance is reachable.
    pub connection_scheme: String,
    /// Port to connect to.
    pub connection_port: Option<i32>,
}

/// Live status of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollStatus {
    /// Provider handle.
    pub provider_instance_id: String,
    /// Challenge launched.
    pub challenge_id: String,
    /// Whether the provider reports the instance as running.
    pub running: bool,
    /// Provider state name.
    pub state: String,
    /// Current endpoint, if known.
    pub endpoint: Option<String>,
    /// Automatic reclamation deadline.
    pub deadline_at: DateTime<Utc>,
    /// Seconds left before the deadline.
    pub remaining_secs: i64,
}

/// Secret-free view of a tracked instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSummary {
    /// Owner holding the instance.
    pub owner_id: OwnerId,
    /// Challenge launched.
    pub challenge_id: String,
    /// Provider handle.
    pub provider_instance_id: String,
    /// Running or reclaiming.
    pub status: RecordStatus,
    /// Last known endpoint.
    pub network_endpoint: Option<String>,
    /// Launch time.
    pub created_at: DateTime<Utc>,
    /// Automatic reclamation deadline.
    pub deadline_at: DateTime<Utc>,
    /// Seconds left before the deadline.
    pub remaining_secs: i64,
    /// Whether the deadline has passed.
    pub expired: bool,
}

impl InstanceSummary {
    fn from_record(record: &InstanceRecord, now: DateTime<Utc>) -> Self {
        Self {
            owner_id: record.owner_id.clone(),
            challenge_id: record.challenge_id.clone(),
            provider_instance_id: record.provider_instance_id.clone(),
            status: record.status,
            network_endpoint: record.network_endpoint.clone(),
            created_at: record.created_at,
            deadline_at: record.deadline_at,
            remaining_secs: record.remaining_secs(now),
            expired: record.is_expired(now),
        }
    }
}

/// What a reclaim did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimReport {
    /// The record was removed. `terminate_error` is set when the provider
    /// call failed and the instance may still exist.
    Reclaimed {
        /// The removed record.
        record: InstanceRecord,
        /// Swallowed termination error.
        terminate_error: Option<String>,
    },
    /// No running record matched (already reclaimed, never existed, still
    /// launching, or not yet expired).
    NothingToReclaim,
    /// The store failed. A claimed record is queued for
    /// [`LifecycleManager::retry_deferred`]; an unclaimed one is picked up
    /// again by the next sweep.
    Deferred {
        /// Store error text.
        reason: String,
    },
}

impl ReclaimReport {
    /// Whether this call removed a record.
    pub fn reclaimed(&self) -> bool {
        matches!(self, Self::Reclaimed { .. })
    }
}

/// Result of a solve submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionOutcome {
    /// Whether the secret matched.
    pub correct: bool,
    /// Whether the instance was torn down as a result.
    pub reclaimed: bool,
}

/// Provider configuration status for administrators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigStatus {
    /// Whether a provider configuration is stored.
    pub configured: bool,
    /// Whether it carries an access key pair.
    pub has_credentials: bool,
    /// Region, if configured.
    pub region: Option<String>,
    /// Gateway implementation in use.
    pub provider_type: &'static str,
}

/// Coordinates the tracker store, the template catalog and the gateway.
pub struct LifecycleManager {
    store: Arc<dyn TrackerStore>,
    configs: Arc<dyn ProviderConfigStore>,
    catalog: Arc<dyn TemplateCatalog>,
    gateway: Arc<dyn ComputeGateway>,
    clock: Arc<dyn Clock>,
    secrets: SecretPolicy,
    deferred: Mutex<Vec<(InstanceRecord, ReclaimOutcome)>>,
}

impl LifecycleManager {
    /// Create a manager from separate store components.
    pub fn new(
        store: Arc<dyn TrackerStore>,
        configs: Arc<dyn ProviderConfigStore>,
        catalog: Arc<dyn TemplateCatalog>,
        gateway: Arc<dyn ComputeGateway>,
    ) -> Self {
        Self {
            store,
            configs,
            catalog,
            gateway,
            clock: Arc::new(SystemClock),
            secrets: SecretPolicy::default(),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Create a manager whose store, config and catalog all come from one backend.
    pub fn from_persistence<P>(persistence: Arc<P>, gateway: Arc<dyn ComputeGateway>) -> Self
    where
        P: TrackerStore + ProviderConfigStore + TemplateCatalog + 'static,
    {
        Self::new(
            persistence.clone(),
            persistence.clone(),
            persistence,
            gateway,
        )
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the secret policy.
    pub fn with_secret_policy(mut self, secrets: SecretPolicy) -> Self {
        self.secrets = secrets;
        self
    }

    /// Current time according to the manager's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The tracker store.
    pub fn store(&self) -> &Arc<dyn TrackerStore> {
        &self.store
    }

    // ========================================================================
    // Allocate
    // ========================================================================

    /// Launch an instance of `challenge_id` for `owner_id`.
    ///
    /// Fails with [`LifecycleError::AlreadyActive`] while the owner holds any
    /// instance, including one still launching. On any failure after the
    /// reservation, the reservation is released so the owner can retry.
    pub async fn allocate(&self, owner_id: &OwnerId, challenge_id: &str) -> Result<Allocation> {
        match self
            .store
            .reserve_slot(owner_id, challenge_id, self.clock.now())
            .await?
        {
            ReserveOutcome::Reserved => {}
            ReserveOutcome::Occupied(slot) => {
                debug!(
                    owner_id = %owner_id,
                    requested = %challenge_id,
                    active = %slot.challenge_id(),
                    "Allocation refused, owner slot occupied"
                );
                return Err(LifecycleError::AlreadyActive {
                    challenge_id: slot.challenge_id().to_string(),
                    provider_instance_id: slot.provider_instance_id().map(str::to_string),
                });
            }
        }

        match self.launch_reserved(owner_id, challenge_id).await {
            Ok(allocation) => Ok(allocation),
            Err(e) => {
                match self.store.release_reservation(owner_id).await {
                    Ok(_) => {}
                    Err(release_err) => error!(
                        owner_id = %owner_id,
                        error = %release_err,
                        "Failed to release reservation; it will be purged as stale"
                    ),
                }
                Err(e)
            }
        }
    }

    async fn launch_reserved(&self, owner_id: &OwnerId, challenge_id: &str) -> Result<Allocation> {
        let template = self.template(challenge_id).await?;
        let config = self.provider_config().await?;
        deadline_for(&template, self.clock.now())?;

        let secret = self.secrets.generate();
        let request = LaunchRequest::from_template(
            &template,
            &config,
            owner_id,
            bootstrap_payload(&secret, &template),
        );

        let provider_instance_id = self.gateway.launch(&config, &request).await.map_err(|e| {
            warn!(
                owner_id = %owner_id,
                challenge_id = %challenge_id,
                error = %e,
                "Provider launch failed"
            );
            LifecycleError::from(e)
        })?;

        let created_at = self.clock.now();
        let activated = match deadline_for(&template, created_at) {
            Ok(deadline_at) => {
                let new_record = NewInstanceRecord {
                    owner_id: owner_id.clone(),
                    provider_instance_id: provider_instance_id.clone(),
                    secret,
                    created_at,
                    deadline_at,
                };
                self.store
                    .activate_slot(&new_record)
                    .await
                    .map_err(LifecycleError::from)
            }
            Err(e) => Err(e),
        };

        let record = match activated {
            Ok(record) => record,
            Err(e) => {
                error!(
                    owner_id = %owner_id,
                    provider_instance_id = %provider_instance_id,
                    error = %e,
                    "Failed to activate reservation, terminating launched instance"
                );
                if let Err(te) = self.gateway.terminate(&config, &provider_instance_id).await {
                    error!(
                        provider_instance_id = %provider_instance_id,
                        error = %te,
                        "Failed to terminate untracked instance"
                    );
                }
                return Err(e);
            }
        };

        info!(
            owner_id = %owner_id,
            challenge_id = %challenge_id,
            provider_instance_id = %record.provider_instance_id,
            deadline_at = %record.deadline_at,
            "Instance allocated"
        );

        Ok(Allocation {
            provider_instance_id: record.provider_instance_id,
            challenge_id: record.challenge_id,
            created_at: record.created_at,
            deadline_at: record.deadline_at,
            connection_scheme: template.connection_scheme,
            connection_port: template.connection_port,
        })
    }

    // ========================================================================
    // Poll
    // ========================================================================

    /// Report the live status of an instance, refreshing its stored endpoint.
    pub async fn poll(&self, provider_instance_id: &str, requester: &Requester) -> Result<PollStatus> {
        let record = self.record_by_provider_id(provider_instance_id).await?;
        if !requester.may_access(&record.owner_id) {
            return Err(LifecycleError::Forbidden(format!(
                "instance '{}' belongs to another owner",
                provider_instance_id
            )));
        }

        let config = self.provider_config().await?;
        let description = self
            .gateway
            .describe(&config, provider_instance_id)
            .await?;

        if let Some(endpoint) = &description.endpoint
            && record.network_endpoint.as_ref() != Some(endpoint)
        {
            self.store
                .update_endpoint(provider_instance_id, endpoint)
                .await?;
            info!(
                provider_instance_id = %provider_instance_id,
                endpoint = %endpoint,
                "Instance endpoint changed"
            );
        }

        let remaining_secs = record.remaining_secs(self.clock.now());
        Ok(PollStatus {
            provider_instance_id: record.provider_instance_id,
            challenge_id: record.challenge_id,
            running: description.running,
            state: description.state,
            endpoint: description.endpoint.or(record.network_endpoint),
            deadline_at: record.deadline_at,
            remaining_secs,
        })
    }

    // ========================================================================
    // Reclaim
    // ========================================================================

    /// Tear down the selected instance. Idempotent and infallible: repeated or
    /// concurrent calls terminate the instance at most once.
    pub async fn reclaim(&self, selector: &RecordSelector, reason: ReclaimReason) -> ReclaimReport {
        self.claim_and_reclaim(selector, reason, None).await
    }

    /// Reclaim the owner's instance with [`ReclaimReason::Timeout`], but only
    /// if its deadline has passed at the moment of the claim.
    pub async fn reclaim_expired(&self, owner_id: &OwnerId) -> ReclaimReport {
        let selector = RecordSelector::Owner(owner_id.clone());
        let now = self.clock.now();
        self.claim_and_reclaim(&selector, ReclaimReason::Timeout, Some(now))
            .await
    }

    /// Finish a reclaim that was claimed but never completed (for example by
    /// a process that crashed mid-reclaim).
    pub async fn resume_reclaim(&self, record: InstanceRecord) -> ReclaimReport {
        if record.status != RecordStatus::Reclaiming {
            return ReclaimReport::NothingToReclaim;
        }
        let reason = record.reclaim_reason.unwrap_or(ReclaimReason::Timeout);
        self.terminate_and_remove(record, reason).await
    }

    async fn claim_and_reclaim(
        &self,
        selector: &RecordSelector,
        reason: ReclaimReason,
        expired_at: Option<DateTime<Utc>>,
    ) -> ReclaimReport {
        let record = match self
            .store
            .claim_for_reclaim(selector, reason, expired_at)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(selector = %selector, reason = %reason, "Nothing to reclaim");
                return ReclaimReport::NothingToReclaim;
            }
            Err(e) => {
                error!(selector = %selector, reason = %reason, error = %e, "Failed to claim record");
                return ReclaimReport::Deferred {
                    reason: e.to_string(),
                };
            }
        };

        self.terminate_and_remove(record, reason).await
    }

    async fn terminate_and_remove(
        &self,
        record: InstanceRecord,
        reason: ReclaimReason,
    ) -> ReclaimReport {
        let terminate_error = match self.provider_config().await {
            Ok(config) => match self
                .gateway
                .terminate(&config, &record.provider_instance_id)
                .await
            {
                Ok(()) => None,
                Err(GatewayError::NotFound(_)) => {
                    debug!(
                        provider_instance_id = %record.provider_instance_id,
                        "Instance already gone at provider"
                    );
                    None
                }
                Err(e) => Some(e.to_string()),
            },
            Err(e) => Some(e.to_string()),
        };

        if let Some(e) = &terminate_error {
            warn!(
                owner_id = %record.owner_id,
                provider_instance_id = %record.provider_instance_id,
                error = %e,
                "Termination failed; removing record anyway"
            );
        }

        let outcome = ReclaimOutcome {
            reason,
            ended_at: self.clock.now(),
            terminate_error: terminate_error.clone(),
        };

        if let Err(e) = self.store.finish_reclaim(&record, &outcome).await {
            error!(
                owner_id = %record.owner_id,
                provider_instance_id = %record.provider_instance_id,
                error = %e,
                "Failed to remove reclaimed record; queued for retry"
            );
            self.deferred.lock().await.push((record, outcome));
            return ReclaimReport::Deferred {
                reason: e.to_string(),
            };
        }

        info!(
            owner_id = %record.owner_id,
            challenge_id = %record.challenge_id,
            provider_instance_id = %record.provider_instance_id,
            reason = %reason,
            "Instance reclaimed"
        );

        ReclaimReport::Reclaimed {
            record,
            terminate_error,
        }
    }

    /// Retry removing records whose termination went through but whose
    /// removal failed. Returns how many were removed; the rest stay queued.
    pub async fn retry_deferred(&self) -> usize {
        let queued = std::mem::take(&mut *self.deferred.lock().await);
        if queued.is_empty() {
            return 0;
        }

        let mut removed = 0;
        let mut remaining = Vec::new();
        for (record, outcome) in queued {
            match self.store.finish_reclaim(&record, &outcome).await {
                Ok(()) => {
                    info!(
                        owner_id = %record.owner_id,
                        provider_instance_id = %record.provider_instance_id,
                        reason = %outcome.reason,
                        "Deferred reclaim completed"
                    );
                    removed += 1;
                }
                Err(e) => {
                    warn!(
                        owner_id = %record.owner_id,
                        provider_instance_id = %record.provider_instance_id,
                        error = %e,
                        "Deferred reclaim still failing"
                    );
                    remaining.push((record, outcome));
                }
            }
        }

        if !remaining.is_empty() {
            self.deferred.lock().await.extend(remaining);
        }
        removed
    }

    /// Number of reclaims waiting for [`Self::retry_deferred`].
    pub async fn deferred_count(&self) -> usize {
        self.deferred.lock().await.len()
    }

    // ========================================================================
    // Secrets
    // ========================================================================

    /// Compare a submission against the instance's secret. Does not reclaim.
    pub async fn check_secret(&self, provider_instance_id: &str, submitted: &str) -> Result<bool> {
        let record = self.record_by_provider_id(provider_instance_id).await?;
        Ok(secrets_match(&record.secret, submitted))
    }

    /// Check a submission and, when correct, reclaim the instance as solved.
    pub async fn submit_secret(
        &self,
        provider_instance_id: &str,
        submitted: &str,
        requester: &Requester,
    ) -> Result<SubmissionOutcome> {
        let record = self.record_by_provider_id(provider_instance_id).await?;
        if !requester.may_access(&record.owner_id) {
            return Err(LifecycleError::Forbidden(format!(
                "instance '{}' belongs to another owner",
                provider_instance_id
            )));
        }

        if !secrets_match(&record.secret, submitted) {
            debug!(provider_instance_id = %provider_instance_id, "Incorrect secret submitted");
            return Ok(SubmissionOutcome {
                correct: false,
                reclaimed: false,
            });
        }

        let report = self
            .reclaim(
                &RecordSelector::ProviderInstance(provider_instance_id.to_string()),
                ReclaimReason::Solved,
            )
            .await;

        Ok(SubmissionOutcome {
            correct: true,
            reclaimed: report.reclaimed(),
        })
    }

    // ========================================================================
    // Listing & Admin
    // ========================================================================

    /// The owner's current instance, if any. Launches still in flight are omitted.
    pub async fn owner_instances(&self, owner_id: &OwnerId) -> Result<Vec<InstanceSummary>> {
        let now = self.clock.now();
        Ok(match self.store.get_slot(owner_id).await? {
            Some(OwnerSlot::Active(record)) => vec![InstanceSummary::from_record(&record, now)],
            Some(OwnerSlot::Pending(_)) | None => Vec::new(),
        })
    }

    /// Every tracked instance, expired ones included.
    pub async fn list_active(&self) -> Result<Vec<InstanceSummary>> {
        let now = self.clock.now();
        let records = self.store.list_records().await?;
        Ok(records
            .iter()
            .map(|record| InstanceSummary::from_record(record, now))
            .collect())
    }

    /// Reclaimed instances of an owner, newest first.
    pub async fn owner_history(&self, owner_id: &OwnerId, limit: i64) -> Result<Vec<HistoryRecord>> {
        Ok(self.store.list_history(owner_id, limit.max(1)).await?)
    }

    /// Whether a provider configuration is stored and usable.
    pub async fn config_status(&self) -> Result<ConfigStatus> {
        let config = self.configs.get_provider_config().await?;
        Ok(ConfigStatus {
            configured: config.is_some(),
            has_credentials: config.as_ref().is_some_and(ProviderConfig::has_credentials),
            region: config.map(|c| c.region),
            provider_type: self.gateway.provider_type(),
        })
    }

    /// Resources an administrator can reference from templates.
    pub async fn list_launchables(&self) -> Result<Launchables> {
        let config = self.provider_config().await?;
        Ok(self.gateway.list_launchables(&config).await?)
    }

    /// Check the store is reachable.
    pub async fn health_check(&self) -> Result<bool> {
        Ok(self.store.health_check_db().await?)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn provider_config(&self) -> Result<ProviderConfig> {
        self.configs.get_provider_config().await?.ok_or_else(|| {
            LifecycleError::ConfigurationMissing("no provider configuration stored".to_string())
        })
    }

    async fn template(&self, challenge_id: &str) -> Result<ChallengeTemplate> {
        self.catalog
            .get_template(challenge_id)
            .await?
            .ok_or_else(|| {
                LifecycleError::NotFound(format!("challenge template '{}'", challenge_id))
            })
    }

    async fn record_by_provider_id(&self, provider_instance_id: &str) -> Result<InstanceRecord> {
        self.store
            .get_by_provider_id(provider_instance_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("instance '{}'", provider_instance_id)))
    }
}

fn deadline_for(template: &ChallengeTemplate, created_at: DateTime<Utc>) -> Result<DateTime<Utc>> {
    template.deadline_from(created_at).ok_or_else(|| {
        LifecycleError::InvalidTemplate(format!(
            "challenge '{}' has unusable max_lifetime_secs {} (allowed 1..={})",
            template.challenge_id, template.max_lifetime_secs, MAX_LIFETIME_SECS
        ))
    })
}
