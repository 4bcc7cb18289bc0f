// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that reclaims instances past their deadline.
//!
//! Each sweep lists running records whose deadline has passed and hands each
//! one to [`LifecycleManager::reclaim_expired`]. The claim re-checks the
//! deadline atomically, so a record reclaimed by the owner in the meantime
//! is simply skipped. A failure on one record never stops the sweep.
//!
//! The same sweep discards reservations whose launch never finished (the
//! process crashed between reserve and activate), so the owner is not locked
//! out forever. It also retries reclaims whose record removal failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{LifecycleManager, ReclaimReport};

/// Configuration for the reclaim scheduler.
#[derive(Debug, Clone)]
pub struct ReclaimSchedulerConfig {
    /// How often to sweep for expired instances.
    pub poll_interval: Duration,
    /// When false, [`ReclaimScheduler::run`] returns immediately.
    pub enabled: bool,
    /// Reservations older than this are treated as abandoned.
    pub stale_reservation_after: Duration,
}

impl Default for ReclaimSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            enabled: true,
            stale_reservation_after: Duration::from_secs(600),
        }
    }
}

/// Counts from a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Expired records found.
    pub expired: usize,
    /// Records actually reclaimed by this sweep.
    pub reclaimed: usize,
    /// Reclaims this sweep could not finish because the store failed.
    pub deferred: usize,
    /// Earlier deferred reclaims completed by this sweep.
    pub retried: usize,
    /// Abandoned reservations discarded.
    pub purged_reservations: u64,
}

/// Periodic reclaimer of expired instances.
pub struct ReclaimScheduler {
    manager: Arc<LifecycleManager>,
    config: ReclaimSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl ReclaimScheduler {
    /// Create a new scheduler.
    pub fn new(manager: Arc<LifecycleManager>, config: ReclaimSchedulerConfig) -> Self {
        Self {
            manager,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    ///
    /// On startup, reclaims left half-finished by a previous process are
    /// completed before the first sweep.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Automatic reclamation disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Reclaim scheduler started"
        );

        self.resume_interrupted().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reclaim scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.sweep_once().await;
                }
            }
        }

        info!("Reclaim scheduler stopped");
    }

    /// Complete reclaims that were claimed but never finished.
    pub async fn resume_interrupted(&self) -> usize {
        let records = match self.manager.store().list_reclaiming().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to list interrupted reclaims");
                return 0;
            }
        };

        if records.is_empty() {
            return 0;
        }

        info!(count = records.len(), "Resuming interrupted reclaims");

        let mut resumed = 0;
        for record in records {
            if self.manager.resume_reclaim(record).await.reclaimed() {
                resumed += 1;
            }
        }
        resumed
    }

    /// Run one sweep.
    pub async fn sweep_once(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let now = self.manager.now();

        match self.purge_abandoned(now).await {
            Ok(purged) => stats.purged_reservations = purged,
            Err(e) => error!(error = %e, "Failed to purge abandoned reservations"),
        }

        stats.retried = self.manager.retry_deferred().await;

        let expired = match self.manager.store().list_expired(now).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to list expired instances");
                return stats;
            }
        };

        stats.expired = expired.len();
        if expired.is_empty() {
            debug!("No expired instances found");
            return stats;
        }

        info!(count = expired.len(), "Found expired instances to reclaim");

        for record in expired {
            match self.manager.reclaim_expired(&record.owner_id).await {
                ReclaimReport::Reclaimed {
                    terminate_error, ..
                } => {
                    stats.reclaimed += 1;
                    if let Some(e) = terminate_error {
                        warn!(
                            provider_instance_id = %record.provider_instance_id,
                            error = %e,
                            "Expired instance removed but termination failed"
                        );
                    }
                }
                ReclaimReport::NothingToReclaim => {
                    debug!(
                        owner_id = %record.owner_id,
                        "Expired instance already reclaimed elsewhere"
                    );
                }
                ReclaimReport::Deferred { reason } => {
                    stats.deferred += 1;
                    error!(
                        owner_id = %record.owner_id,
                        provider_instance_id = %record.provider_instance_id,
                        error = %reason,
                        "Failed to reclaim expired instance"
                    );
                }
            }
        }

        stats
    }

    /// Delete reservations older than the stale threshold.
    async fn purge_abandoned(&self, now: DateTime<Utc>) -> crate::error::Result<u64> {
        let cutoff = now
            - chrono::Duration::from_std(self.config.stale_reservation_after)
                .map_err(|e| crate::error::Error::Other(format!("Invalid duration: {}", e)))?;

        let purged = self
            .manager
            .store()
            .purge_stale_reservations(cutoff)
            .await?;
        if purged > 0 {
            warn!(count = purged, "Discarded abandoned reservations");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReclaimSchedulerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert!(config.enabled);
        assert_eq!(config.stale_reservation_after, Duration::from_secs(600));
    }
}
