// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for instancer-environment.
//!
//! [`InstancerRuntime`] wires a persistence backend, a compute gateway, the
//! lifecycle manager and the reclaim scheduler together, so the instancer can
//! be embedded into the platform's existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use instancer_core::persistence::PostgresPersistence;
//! use instancer_environment::gateway::{HttpComputeGateway, ResilientGateway};
//! use instancer_environment::runtime::InstancerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let persistence = Arc::new(PostgresPersistence::new(pool));
//!
//!     let runtime = InstancerRuntime::builder()
//!         .persistence(persistence)
//!         .gateway(Arc::new(ResilientGateway::new(HttpComputeGateway::new())))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // handlers operate on runtime.state()
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use instancer_core::persistence::{ProviderConfigStore, TemplateCatalog, TrackerStore};
use instancer_core::{Clock, SystemClock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::gateway::ComputeGateway;
use crate::handlers::InstancerHandlerState;
use crate::lifecycle::LifecycleManager;
use crate::reclaim_scheduler::{ReclaimScheduler, ReclaimSchedulerConfig};
use crate::secret::SecretPolicy;

/// Builder for [`InstancerRuntime`].
pub struct InstancerRuntimeBuilder {
    store: Option<Arc<dyn TrackerStore>>,
    configs: Option<Arc<dyn ProviderConfigStore>>,
    catalog: Option<Arc<dyn TemplateCatalog>>,
    gateway: Option<Arc<dyn ComputeGateway>>,
    clock: Arc<dyn Clock>,
    secret_policy: SecretPolicy,
    scheduler_config: ReclaimSchedulerConfig,
}

impl Default for InstancerRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            configs: None,
            catalog: None,
            gateway: None,
            clock: Arc::new(SystemClock),
            secret_policy: SecretPolicy::default(),
            scheduler_config: ReclaimSchedulerConfig::default(),
        }
    }
}

impl InstancerRuntimeBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one backend for tracking, provider config and templates.
    pub fn persistence<P>(mut self, persistence: Arc<P>) -> Self
    where
        P: TrackerStore + ProviderConfigStore + TemplateCatalog + 'static,
    {
        self.store = Some(persistence.clone());
        self.configs = Some(persistence.clone());
        self.catalog = Some(persistence);
        self
    }

    /// Override the template catalog (for platforms that keep templates elsewhere).
    pub fn catalog(mut self, catalog: Arc<dyn TemplateCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the compute gateway.
    pub fn gateway(mut self, gateway: Arc<dyn ComputeGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the secret policy.
    pub fn secret_policy(mut self, policy: SecretPolicy) -> Self {
        self.secret_policy = policy;
        self
    }

    /// Set the reclaim scheduler configuration.
    pub fn scheduler_config(mut self, config: ReclaimSchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Validate the builder and produce a startable configuration.
    pub fn build(self) -> Result<InstancerRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let configs = self
            .configs
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let catalog = self
            .catalog
            .ok_or_else(|| anyhow::anyhow!("template catalog is required"))?;
        let gateway = self
            .gateway
            .ok_or_else(|| anyhow::anyhow!("gateway is required"))?;

        let manager = LifecycleManager::new(store, configs, catalog, gateway)
            .with_clock(self.clock)
            .with_secret_policy(self.secret_policy);

        Ok(InstancerRuntimeConfig {
            manager: Arc::new(manager),
            scheduler_config: self.scheduler_config,
        })
    }
}

/// Validated runtime configuration, ready to start.
pub struct InstancerRuntimeConfig {
    manager: Arc<LifecycleManager>,
    scheduler_config: ReclaimSchedulerConfig,
}

impl InstancerRuntimeConfig {
    /// Start the reclaim scheduler and return the running runtime.
    pub async fn start(self) -> Result<InstancerRuntime> {
        let state = Arc::new(InstancerHandlerState::new(self.manager.clone()));

        let auto_reclaim = self.scheduler_config.enabled;
        let scheduler = ReclaimScheduler::new(self.manager, self.scheduler_config);
        let scheduler_shutdown = scheduler.shutdown_handle();

        let scheduler_handle = tokio::spawn(async move {
            scheduler.run().await;
        });

        info!(auto_reclaim, "InstancerRuntime started");

        Ok(InstancerRuntime {
            scheduler_handle,
            scheduler_shutdown,
            state,
        })
    }
}

/// A running instancer.
pub struct InstancerRuntime {
    scheduler_handle: JoinHandle<()>,
    scheduler_shutdown: Arc<Notify>,
    state: Arc<InstancerHandlerState>,
}

impl InstancerRuntime {
    /// Create a runtime builder.
    pub fn builder() -> InstancerRuntimeBuilder {
        InstancerRuntimeBuilder::new()
    }

    /// Handler state for serving requests.
    pub fn state(&self) -> &Arc<InstancerHandlerState> {
        &self.state
    }

    /// The lifecycle manager.
    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.state.manager
    }

    /// Whether the scheduler task is still running. False once it exits,
    /// which happens immediately when automatic reclamation is disabled.
    pub fn is_running(&self) -> bool {
        !self.scheduler_handle.is_finished()
    }

    /// Stop the scheduler and wait for it to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("InstancerRuntime shutting down...");

        self.scheduler_shutdown.notify_one();

        if let Err(e) = self.scheduler_handle.await {
            error!("Reclaim scheduler task panicked: {}", e);
            return Err(anyhow::anyhow!("reclaim scheduler task panicked: {}", e));
        }

        info!("InstancerRuntime shutdown complete");
        Ok(())
    }
}
