// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instancer request handlers.
//!
//! Thin layer between the platform's HTTP surface and the lifecycle manager.
//! Every response carries `success`, an optional typed error and the minimal
//! payload; lifecycle errors never escape as `Err`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use instancer_core::OwnerId;
use instancer_core::persistence::{HistoryRecord, ReclaimReason, RecordSelector};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, LifecycleError};
use crate::gateway::Launchables;
use crate::lifecycle::{
    Allocation, ConfigStatus, InstanceSummary, LifecycleManager, PollStatus, ReclaimReport,
    Requester,
};

/// Default number of history rows returned to an owner.
pub const DEFAULT_HISTORY_LIMIT: i64 = 20;

/// Shared state for instancer handlers.
pub struct InstancerHandlerState {
    /// Lifecycle manager that performs every operation.
    pub manager: Arc<LifecycleManager>,
    /// When the server started (for uptime calculation).
    pub start_time: std::time::Instant,
    /// Server version string.
    pub version: String,
}

impl InstancerHandlerState {
    /// Create a new handler state.
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self {
            manager,
            start_time: std::time::Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Get the server uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }
}

/// Typed error carried in responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Stable error code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
}

impl From<&LifecycleError> for ApiError {
    fn from(err: &LifecycleError) -> Self {
        Self {
            kind: err.kind(),
            code: err.error_code(),
            message: err.to_string(),
        }
    }
}

fn api_error(err: LifecycleError) -> Option<ApiError> {
    Some(ApiError::from(&err))
}

// ============================================================================
// Health Check
// ============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResponse {
    /// Whether the tracking store is reachable.
    pub healthy: bool,
    /// Server version.
    pub version: String,
    /// Server uptime in milliseconds.
    pub uptime_ms: i64,
}

/// Handle health check request.
pub async fn handle_health_check(state: &InstancerHandlerState) -> HealthCheckResponse {
    let healthy = state.manager.health_check().await.unwrap_or(false);

    HealthCheckResponse {
        healthy,
        version: state.version.clone(),
        uptime_ms: state.uptime_ms(),
    }
}

// ============================================================================
// Allocate
// ============================================================================

/// Request to launch an instance.
#[derive(Debug, Clone)]
pub struct AllocateRequest {
    /// Caller identity.
    pub requester: Requester,
    /// Challenge to launch.
    pub challenge_id: String,
}

/// Response from an allocation.
#[derive(Debug, Clone, Serialize)]
pub struct AllocateResponse {
    /// Whether the instance was launched.
    pub success: bool,
    /// The launched instance.
    pub allocation: Option<Allocation>,
    /// Challenge of the instance already held, on `already_active`.
    pub active_challenge_id: Option<String>,
    /// Provider handle of the instance already held, on `already_active`.
    pub active_instance_id: Option<String>,
    /// Error if failed.
    pub error: Option<ApiError>,
}

/// Handle an allocation request.
pub async fn handle_allocate(
    state: &InstancerHandlerState,
    request: AllocateRequest,
) -> AllocateResponse {
    info!(
        owner_id = %request.requester.owner_id,
        challenge_id = %request.challenge_id,
        "Allocate request received"
    );

    if request.challenge_id.is_empty() {
        return AllocateResponse {
            success: false,
            allocation: None,
            active_challenge_id: None,
            active_instance_id: None,
            error: api_error(LifecycleError::NotFound(
                "challenge_id is required".to_string(),
            )),
        };
    }

    match state
        .manager
        .allocate(&request.requester.owner_id, &request.challenge_id)
        .await
    {
        Ok(allocation) => AllocateResponse {
            success: true,
            allocation: Some(allocation),
            active_challenge_id: None,
            active_instance_id: None,
            error: None,
        },
        Err(e) => {
            let (active_challenge_id, active_instance_id) = match &e {
                LifecycleError::AlreadyActive {
                    challenge_id,
                    provider_instance_id,
                } => (Some(challenge_id.clone()), provider_instance_id.clone()),
                _ => (None, None),
            };
            AllocateResponse {
                success: false,
                allocation: None,
                active_challenge_id,
                active_instance_id,
                error: api_error(e),
            }
        }
    }
}

// ============================================================================
// Poll
// ============================================================================

/// Request for the live status of an instance.
#[derive(Debug, Clone)]
pub struct PollRequest {
    /// Caller identity.
    pub requester: Requester,
    /// Instance to poll.
    pub provider_instance_id: String,
}

/// Response from a poll.
#[derive(Debug, Clone, Serialize)]
pub struct PollResponse {
    /// Whether the poll succeeded.
    pub success: bool,
    /// Instance status.
    pub status: Option<PollStatus>,
    /// Error if failed.
    pub error: Option<ApiError>,
}

/// Handle a poll request.
pub async fn handle_poll(state: &InstancerHandlerState, request: PollRequest) -> PollResponse {
    match state
        .manager
        .poll(&request.provider_instance_id, &request.requester)
        .await
    {
        Ok(status) => PollResponse {
            success: true,
            status: Some(status),
            error: None,
        },
        Err(e) => {
            debug!(
                provider_instance_id = %request.provider_instance_id,
                error = %e,
                "Poll failed"
            );
            PollResponse {
                success: false,
                status: None,
                error: api_error(e),
            }
        }
    }
}

// ============================================================================
// Reclaim
// ============================================================================

/// Request to tear down an instance.
#[derive(Debug, Clone)]
pub struct ReclaimRequest {
    /// Caller identity.
    pub requester: Requester,
    /// Which record to reclaim.
    pub selector: RecordSelector,
    /// Why the instance is torn down.
    pub reason: ReclaimReason,
}

/// Response from a reclaim.
#[derive(Debug, Clone, Serialize)]
pub struct ReclaimResponse {
    /// Whether the request was accepted. True for a no-op.
    pub success: bool,
    /// Whether this call removed a record.
    pub reclaimed: bool,
    /// Provider handle of the removed instance.
    pub provider_instance_id: Option<String>,
    /// Set when the provider refused to terminate; the record is gone anyway.
    pub terminate_error: Option<String>,
    /// The store failed mid-reclaim; the service finishes it in the background.
    pub deferred: bool,
    /// Error if failed.
    pub error: Option<ApiError>,
}

impl ReclaimResponse {
    fn rejected(err: LifecycleError) -> Self {
        Self {
            success: false,
            reclaimed: false,
            provider_instance_id: None,
            terminate_error: None,
            deferred: false,
            error: api_error(err),
        }
    }
}

/// Handle a reclaim request.
///
/// Participants may reclaim only their own record and never with
/// [`ReclaimReason::AdminTerminate`]. Reclaiming a record that does not exist
/// succeeds without doing anything.
pub async fn handle_reclaim(
    state: &InstancerHandlerState,
    request: ReclaimRequest,
) -> ReclaimResponse {
    let requester = &request.requester;

    if !requester.is_admin {
        if request.reason == ReclaimReason::AdminTerminate {
            return ReclaimResponse::rejected(LifecycleError::Forbidden(
                "admin_terminate requires administrator rights".to_string(),
            ));
        }

        let owner = match &request.selector {
            RecordSelector::Owner(owner_id) => Some(owner_id.clone()),
            RecordSelector::ProviderInstance(id) => {
                match state.manager.store().get_by_provider_id(id).await {
                    Ok(record) => record.map(|r| r.owner_id),
                    Err(e) => return ReclaimResponse::rejected(e.into()),
                }
            }
        };

        if let Some(owner_id) = owner
            && owner_id != requester.owner_id
        {
            warn!(
                requester = %requester.owner_id,
                selector = %request.selector,
                "Reclaim of another owner's instance refused"
            );
            return ReclaimResponse::rejected(LifecycleError::Forbidden(format!(
                "{} belongs to another owner",
                request.selector
            )));
        }
    }

    match state
        .manager
        .reclaim(&request.selector, request.reason)
        .await
    {
        ReclaimReport::Reclaimed {
            record,
            terminate_error,
        } => ReclaimResponse {
            success: true,
            reclaimed: true,
            provider_instance_id: Some(record.provider_instance_id),
            terminate_error,
            deferred: false,
            error: None,
        },
        ReclaimReport::NothingToReclaim => ReclaimResponse {
            success: true,
            reclaimed: false,
            provider_instance_id: None,
            terminate_error: None,
            deferred: false,
            error: None,
        },
        ReclaimReport::Deferred { reason } => {
            warn!(
                selector = %request.selector,
                error = %reason,
                "Reclaim deferred after store failure"
            );
            ReclaimResponse {
                success: true,
                reclaimed: false,
                provider_instance_id: None,
                terminate_error: None,
                deferred: true,
                error: None,
            }
        }
    }
}

// ============================================================================
// Secrets
// ============================================================================

/// Request to compare a submission with an instance's secret.
#[derive(Debug, Clone)]
pub struct CheckSecretRequest {
    /// Instance the submission refers to.
    pub provider_instance_id: String,
    /// Submitted value, compared verbatim.
    pub submitted: String,
}

/// Response from a secret check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckSecretResponse {
    /// Whether the check ran.
    pub success: bool,
    /// Whether the submission matched.
    pub correct: bool,
    /// Error if failed.
    pub error: Option<ApiError>,
}

/// Handle a secret check. Does not reclaim.
pub async fn handle_check_secret(
    state: &InstancerHandlerState,
    request: CheckSecretRequest,
) -> CheckSecretResponse {
    match state
        .manager
        .check_secret(&request.provider_instance_id, &request.submitted)
        .await
    {
        Ok(correct) => CheckSecretResponse {
            success: true,
            correct,
            error: None,
        },
        Err(e) => CheckSecretResponse {
            success: false,
            correct: false,
            error: api_error(e),
        },
    }
}

/// Request to submit a solve.
#[derive(Debug, Clone)]
pub struct SubmitSecretRequest {
    /// Caller identity.
    pub requester: Requester,
    /// Instance the submission refers to.
    pub provider_instance_id: String,
    /// Submitted value, compared verbatim.
    pub submitted: String,
}

/// Response from a solve submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitSecretResponse {
    /// Whether the submission was processed.
    pub success: bool,
    /// Whether the submission matched.
    pub correct: bool,
    /// Whether the instance was torn down.
    pub reclaimed: bool,
    /// Error if failed.
    pub error: Option<ApiError>,
}

/// Handle a solve submission: check, then reclaim as solved on success.
pub async fn handle_submit_secret(
    state: &InstancerHandlerState,
    request: SubmitSecretRequest,
) -> SubmitSecretResponse {
    match state
        .manager
        .submit_secret(
            &request.provider_instance_id,
            &request.submitted,
            &request.requester,
        )
        .await
    {
        Ok(outcome) => SubmitSecretResponse {
            success: true,
            correct: outcome.correct,
            reclaimed: outcome.reclaimed,
            error: None,
        },
        Err(e) => SubmitSecretResponse {
            success: false,
            correct: false,
            reclaimed: false,
            error: api_error(e),
        },
    }
}

// ============================================================================
// Listing
// ============================================================================

/// Response listing instances.
#[derive(Debug, Clone, Serialize)]
pub struct ListInstancesResponse {
    /// Whether the listing succeeded.
    pub success: bool,
    /// Instances, without secrets.
    pub instances: Vec<InstanceSummary>,
    /// Error if failed.
    pub error: Option<ApiError>,
}

impl ListInstancesResponse {
    fn from_result(result: Result<Vec<InstanceSummary>, LifecycleError>) -> Self {
        match result {
            Ok(instances) => Self {
                success: true,
                instances,
                error: None,
            },
            Err(e) => Self {
                success: false,
                instances: Vec::new(),
                error: api_error(e),
            },
        }
    }
}

/// Handle "my instances" for the requesting owner.
pub async fn handle_owner_instances(
    state: &InstancerHandlerState,
    requester: &Requester,
) -> ListInstancesResponse {
    ListInstancesResponse::from_result(state.manager.owner_instances(&requester.owner_id).await)
}

/// Handle the admin status view. Expired instances are included.
pub async fn handle_list_active(
    state: &InstancerHandlerState,
    requester: &Requester,
) -> ListInstancesResponse {
    if !requester.is_admin {
        return ListInstancesResponse::from_result(Err(LifecycleError::Forbidden(
            "listing all instances requires administrator rights".to_string(),
        )));
    }
    ListInstancesResponse::from_result(state.manager.list_active().await)
}

/// History entry as shown to owners.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// Challenge launched.
    pub challenge_id: String,
    /// Provider handle.
    pub provider_instance_id: String,
    /// Launch time.
    pub started_at: DateTime<Utc>,
    /// Reclaim time.
    pub ended_at: DateTime<Utc>,
    /// Why it ended.
    pub reason: ReclaimReason,
}

impl From<HistoryRecord> for HistoryEntry {
    fn from(record: HistoryRecord) -> Self {
        Self {
            challenge_id: record.challenge_id,
            provider_instance_id: record.provider_instance_id,
            started_at: record.started_at,
            ended_at: record.ended_at,
            reason: record.reason,
        }
    }
}

/// Response listing past instances.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    /// Whether the listing succeeded.
    pub success: bool,
    /// Entries, newest first.
    pub entries: Vec<HistoryEntry>,
    /// Error if failed.
    pub error: Option<ApiError>,
}

/// Handle the owner's instance history.
pub async fn handle_owner_history(
    state: &InstancerHandlerState,
    owner_id: &OwnerId,
    requester: &Requester,
    limit: Option<i64>,
) -> HistoryResponse {
    if !requester.may_access(owner_id) {
        return HistoryResponse {
            success: false,
            entries: Vec::new(),
            error: api_error(LifecycleError::Forbidden(
                "history belongs to another owner".to_string(),
            )),
        };
    }

    match state
        .manager
        .owner_history(owner_id, limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        .await
    {
        Ok(records) => HistoryResponse {
            success: true,
            entries: records.into_iter().map(HistoryEntry::from).collect(),
            error: None,
        },
        Err(e) => HistoryResponse {
            success: false,
            entries: Vec::new(),
            error: api_error(e),
        },
    }
}

// ============================================================================
// Admin
// ============================================================================

/// Response with provider configuration status.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigStatusResponse {
    /// Whether the status was read.
    pub success: bool,
    /// Configuration status.
    pub status: Option<ConfigStatus>,
    /// Error if failed.
    pub error: Option<ApiError>,
}

/// Handle a provider configuration status request.
pub async fn handle_config_status(
    state: &InstancerHandlerState,
    requester: &Requester,
) -> ConfigStatusResponse {
    let result = if requester.is_admin {
        state.manager.config_status().await
    } else {
        Err(LifecycleError::Forbidden(
            "configuration status requires administrator rights".to_string(),
        ))
    };

    match result {
        Ok(status) => ConfigStatusResponse {
            success: true,
            status: Some(status),
            error: None,
        },
        Err(e) => ConfigStatusResponse {
            success: false,
            status: None,
            error: api_error(e),
        },
    }
}

/// Response with resources usable by templates.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchablesResponse {
    /// Whether the listing succeeded.
    pub success: bool,
    /// Images, subnets and security groups.
    pub launchables: Launchables,
    /// Error if failed.
    pub error: Option<ApiError>,
}

/// Handle a launchable resources request.
pub async fn handle_list_launchables(
    state: &InstancerHandlerState,
    requester: &Requester,
) -> LaunchablesResponse {
    let result = if requester.is_admin {
        state.manager.list_launchables().await
    } else {
        Err(LifecycleError::Forbidden(
            "listing launchables requires administrator rights".to_string(),
        ))
    };

    match result {
        Ok(launchables) => LaunchablesResponse {
            success: true,
            launchables,
            error: None,
        },
        Err(e) => LaunchablesResponse {
            success: false,
            launchables: Launchables::default(),
            error: api_error(e),
        },
    }
}
