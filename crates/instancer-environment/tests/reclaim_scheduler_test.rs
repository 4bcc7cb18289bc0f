// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reclaim scheduler tests.

mod common;

use std::time::Duration;

use common::{PWN, START, TestContext, WEB};
use instancer_core::OwnerId;
use instancer_core::clock::from_unix;
use instancer_core::persistence::{ReclaimReason, RecordSelector, TrackerStore};
use instancer_environment::gateway::GatewayError;
use instancer_environment::reclaim_scheduler::{
    ReclaimScheduler, ReclaimSchedulerConfig, SweepStats,
};

fn owner(id: &str) -> OwnerId {
    OwnerId::from(id)
}

fn scheduler(ctx: &TestContext, config: ReclaimSchedulerConfig) -> ReclaimScheduler {
    ReclaimScheduler::new(ctx.manager.clone(), config)
}

#[tokio::test]
async fn test_sweep_reclaims_expired_records_once() {
    let ctx = TestContext::new().await;
    let expired = ctx.manager.allocate(&owner("u1"), PWN).await.unwrap();
    ctx.manager.allocate(&owner("u2"), WEB).await.unwrap();

    let scheduler = scheduler(&ctx, ReclaimSchedulerConfig::default());

    ctx.clock.set(START + 600);
    let stats = scheduler.sweep_once().await;
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.reclaimed, 1);

    assert_eq!(
        ctx.gateway.terminated_ids().await,
        vec![expired.provider_instance_id]
    );
    assert_eq!(ctx.record_count("u1").await, 0);
    assert_eq!(ctx.record_count("u2").await, 1);

    // Next sweep finds nothing new
    let stats = scheduler.sweep_once().await;
    assert_eq!(stats, SweepStats::default());
    assert_eq!(ctx.gateway.terminate_count(), 1);

    let history = ctx.store.list_history(&owner("u1"), 10).await.unwrap();
    assert_eq!(history[0].reason, ReclaimReason::Timeout);
    assert_eq!(history[0].ended_at, from_unix(START + 600));
}

#[tokio::test]
async fn test_sweep_leaves_unexpired_records() {
    let ctx = TestContext::new().await;
    ctx.manager.allocate(&owner("u1"), WEB).await.unwrap();

    ctx.clock.set(START + 1799);
    let stats = scheduler(&ctx, ReclaimSchedulerConfig::default())
        .sweep_once()
        .await;

    assert_eq!(stats.expired, 0);
    assert_eq!(ctx.gateway.terminate_count(), 0);
    assert_eq!(ctx.record_count("u1").await, 1);
}

#[tokio::test]
async fn test_sweep_continues_past_terminate_failures() {
    let ctx = TestContext::new().await;
    for id in ["u1", "u2", "u3"] {
        ctx.manager.allocate(&owner(id), PWN).await.unwrap();
    }
    ctx.gateway
        .set_terminate_failure(Some(GatewayError::Transient("throttled".to_string())))
        .await;

    ctx.clock.set(START + 601);
    let stats = scheduler(&ctx, ReclaimSchedulerConfig::default())
        .sweep_once()
        .await;

    assert_eq!(stats.expired, 3);
    assert_eq!(stats.reclaimed, 3);
    assert_eq!(ctx.gateway.terminate_count(), 3);
    for id in ["u1", "u2", "u3"] {
        assert_eq!(ctx.record_count(id).await, 0);
        let history = ctx.store.list_history(&owner(id), 1).await.unwrap();
        assert!(history[0].terminate_error.is_some());
    }
}

#[tokio::test]
async fn test_sweep_skips_records_reclaimed_meanwhile() {
    let ctx = TestContext::new().await;
    ctx.manager.allocate(&owner("u1"), PWN).await.unwrap();
    ctx.clock.set(START + 600);

    // Owner solves between listing and claiming
    let claimed = ctx
        .store
        .claim_for_reclaim(
            &RecordSelector::Owner(owner("u1")),
            ReclaimReason::Solved,
            None,
        )
        .await
        .unwrap();
    assert!(claimed.is_some());

    let stats = scheduler(&ctx, ReclaimSchedulerConfig::default())
        .sweep_once()
        .await;

    // Reclaiming records are not listed as expired
    assert_eq!(stats.expired, 0);
    assert_eq!(ctx.gateway.terminate_count(), 0);
}

#[tokio::test]
async fn test_sweep_purges_abandoned_reservations() {
    let ctx = TestContext::new().await;
    ctx.store
        .reserve_slot(&owner("crashed"), WEB, from_unix(START))
        .await
        .unwrap();

    let scheduler = scheduler(
        &ctx,
        ReclaimSchedulerConfig {
            stale_reservation_after: Duration::from_secs(600),
            ..ReclaimSchedulerConfig::default()
        },
    );

    ctx.clock.set(START + 599);
    assert_eq!(scheduler.sweep_once().await.purged_reservations, 0);
    assert!(
        ctx.manager
            .allocate(&owner("crashed"), WEB)
            .await
            .is_err()
    );

    ctx.clock.set(START + 601);
    assert_eq!(scheduler.sweep_once().await.purged_reservations, 1);
    assert!(ctx.manager.allocate(&owner("crashed"), WEB).await.is_ok());
}

#[tokio::test]
async fn test_resume_interrupted_reclaims() {
    let ctx = TestContext::new().await;
    ctx.manager.allocate(&owner("u1"), WEB).await.unwrap();
    ctx.manager.allocate(&owner("u2"), WEB).await.unwrap();

    ctx.store
        .claim_for_reclaim(
            &RecordSelector::Owner(owner("u1")),
            ReclaimReason::AdminTerminate,
            None,
        )
        .await
        .unwrap()
        .unwrap();

    let resumed = scheduler(&ctx, ReclaimSchedulerConfig::default())
        .resume_interrupted()
        .await;

    assert_eq!(resumed, 1);
    assert_eq!(ctx.record_count("u1").await, 0);
    assert_eq!(ctx.record_count("u2").await, 1);
    let history = ctx.store.list_history(&owner("u1"), 1).await.unwrap();
    assert_eq!(history[0].reason, ReclaimReason::AdminTerminate);
}

#[tokio::test]
async fn test_disabled_scheduler_returns_immediately() {
    let ctx = TestContext::new().await;
    ctx.manager.allocate(&owner("u1"), PWN).await.unwrap();
    ctx.clock.set(START + 10_000);

    let scheduler = scheduler(
        &ctx,
        ReclaimSchedulerConfig {
            enabled: false,
            ..ReclaimSchedulerConfig::default()
        },
    );

    tokio::time::timeout(Duration::from_secs(5), scheduler.run())
        .await
        .expect("disabled scheduler should not loop");

    // Expired record stays listed for admins
    assert_eq!(ctx.gateway.terminate_count(), 0);
    let all = ctx.manager.list_active().await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].expired);
}

#[tokio::test]
async fn test_run_sweeps_until_shutdown() {
    let ctx = TestContext::new().await;
    ctx.manager.allocate(&owner("u1"), PWN).await.unwrap();
    ctx.clock.set(START + 600);

    let scheduler = scheduler(
        &ctx,
        ReclaimSchedulerConfig {
            poll_interval: Duration::from_millis(20),
            ..ReclaimSchedulerConfig::default()
        },
    );
    let shutdown = scheduler.shutdown_handle();
    let handle = tokio::spawn(async move { scheduler.run().await });

    let mut reclaimed = false;
    for _ in 0..100 {
        if ctx.record_count("u1").await == 0 {
            reclaimed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reclaimed, "expired record was never swept");

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();

    assert_eq!(ctx.gateway.terminate_count(), 1);
}

#[tokio::test]
async fn test_sweep_finishes_reclaims_deferred_by_store_failure() {
    let ctx = TestContext::new().await;
    let first = ctx.manager.allocate(&owner("u1"), PWN).await.unwrap();
    let scheduler = scheduler(&ctx, ReclaimSchedulerConfig::default());

    ctx.faults.fail_next_finishes(1);
    ctx.clock.set(START + 600);

    let stats = scheduler.sweep_once().await;
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.reclaimed, 0);
    assert_eq!(stats.deferred, 1);
    assert_eq!(ctx.manager.deferred_count().await, 1);

    // Still blocked until the record is removed
    let err = ctx.manager.allocate(&owner("u1"), WEB).await.unwrap_err();
    assert_eq!(err.error_code(), "ALREADY_ACTIVE");

    let stats = scheduler.sweep_once().await;
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.expired, 0);
    assert_eq!(ctx.manager.deferred_count().await, 0);

    // Terminated once, recorded once
    assert_eq!(ctx.gateway.terminate_count(), 1);
    let history = ctx.store.list_history(&owner("u1"), 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].provider_instance_id, first.provider_instance_id);
    assert_eq!(history[0].reason, ReclaimReason::Timeout);

    ctx.manager.allocate(&owner("u1"), WEB).await.unwrap();
    assert_eq!(scheduler.sweep_once().await, SweepStats::default());
}

#[tokio::test]
async fn test_deferred_reclaim_survives_repeated_failures() {
    let ctx = TestContext::new().await;
    ctx.manager.allocate(&owner("u1"), PWN).await.unwrap();
    let scheduler = scheduler(&ctx, ReclaimSchedulerConfig::default());

    ctx.faults.fail_next_finishes(3);
    ctx.clock.set(START + 600);

    assert_eq!(scheduler.sweep_once().await.deferred, 1);
    assert_eq!(scheduler.sweep_once().await.retried, 0);
    assert_eq!(scheduler.sweep_once().await.retried, 0);
    assert_eq!(ctx.manager.deferred_count().await, 1);

    assert_eq!(scheduler.sweep_once().await.retried, 1);
    assert_eq!(ctx.record_count("u1").await, 0);
    assert_eq!(ctx.gateway.terminate_count(), 1);
}
