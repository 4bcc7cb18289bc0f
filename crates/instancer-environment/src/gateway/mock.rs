// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock compute gateway for testing.
//!
//! Keeps launched instances in memory and lets tests inject failures and
//! inspect how often each operation was called.

use async_trait::async_trait;
use instancer_core::persistence::ProviderConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::traits::*;

/// Mock instance state.
#[derive(Debug, Clone)]
struct MockInstance {
    request: LaunchRequest,
    state: String,
    endpoint: Option<String>,
}

#[derive(Debug, Default)]
struct Failures {
    /// One-shot launch failures, consumed in order.
    launch_queue: VecDeque<GatewayError>,
    /// Returned by every launch while set.
    launch: Option<GatewayError>,
    /// Returned by every terminate while set.
    terminate: Option<GatewayError>,
    /// Returned by every describe while set.
    describe: Option<GatewayError>,
}

/// In-memory compute provider.
pub struct MockGateway {
    instances: Mutex<HashMap<String, MockInstance>>,
    failures: Mutex<Failures>,
    terminated: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    launch_calls: AtomicUsize,
    describe_calls: AtomicUsize,
    terminate_calls: AtomicUsize,
    /// Delay applied inside every launch, to widen race windows in tests.
    pub launch_delay: Duration,
    /// Endpoint assigned to new instances. `None` leaves them unassigned.
    pub default_endpoint: Option<String>,
    launchables: Launchables,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    /// Create a mock gateway whose operations all succeed.
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            failures: Mutex::new(Failures::default()),
            terminated: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            launch_calls: AtomicUsize::new(0),
            describe_calls: AtomicUsize::new(0),
            terminate_calls: AtomicUsize::new(0),
            launch_delay: Duration::ZERO,
            default_endpoint: None,
            launchables: Launchables::default(),
        }
    }

    /// Create a mock gateway where every launch fails with `error`.
    pub fn failing(error: GatewayError) -> Self {
        let mut gateway = Self::new();
        gateway.failures.get_mut().launch = Some(error);
        gateway
    }

    /// Set the resources returned by `list_launchables`.
    pub fn with_launchables(mut self, launchables: Launchables) -> Self {
        self.launchables = launchables;
        self
    }

    /// Fail every launch with `error` until cleared with `None`.
    pub async fn set_launch_failure(&self, error: Option<GatewayError>) {
        self.failures.lock().await.launch = error;
    }

    /// Fail the next launch only.
    pub async fn push_launch_failure(&self, error: GatewayError) {
        self.failures.lock().await.launch_queue.push_back(error);
    }

    /// Fail every terminate with `error` until cleared with `None`.
    pub async fn set_terminate_failure(&self, error: Option<GatewayError>) {
        self.failures.lock().await.terminate = error;
    }

    /// Fail every describe with `error` until cleared with `None`.
    pub async fn set_describe_failure(&self, error: Option<GatewayError>) {
        self.failures.lock().await.describe = error;
    }

    /// Assign a new endpoint to an instance, as a provider does after a restart.
    pub async fn set_endpoint(&self, provider_instance_id: &str, endpoint: &str) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(provider_instance_id) {
            instance.endpoint = Some(endpoint.to_string());
        }
    }

    /// Change the provider state of an instance.
    pub async fn set_state(&self, provider_instance_id: &str, state: &str) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(provider_instance_id) {
            instance.state = state.to_string();
        }
    }

    /// The request an instance was launched with.
    pub async fn launched_request(&self, provider_instance_id: &str) -> Option<LaunchRequest> {
        let instances = self.instances.lock().await;
        instances
            .get(provider_instance_id)
            .map(|instance| instance.request.clone())
    }

    /// Whether an instance exists and has not been terminated.
    pub async fn is_alive(&self, provider_instance_id: &str) -> bool {
        let instances = self.instances.lock().await;
        instances
            .get(provider_instance_id)
            .is_some_and(|instance| instance.state != "terminated")
    }

    /// Handles of every terminate call that reached the provider, in order.
    pub async fn terminated_ids(&self) -> Vec<String> {
        self.terminated.lock().await.clone()
    }

    /// Number of launch calls, failed ones included.
    pub fn launch_count(&self) -> usize {
        self.launch_calls.load(Ordering::SeqCst)
    }

    /// Number of describe calls.
    pub fn describe_count(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    /// Number of terminate calls, failed ones included.
    pub fn terminate_count(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeGateway for MockGateway {
    fn provider_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, _config: &ProviderConfig, request: &LaunchRequest) -> Result<String> {
        self.launch_calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut failures = self.failures.lock().await;
            if let Some(error) = failures.launch_queue.pop_front() {
                return Err(error);
            }
            if let Some(error) = &failures.launch {
                return Err(error.clone());
            }
        }

        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }

        let id = format!("i-mock-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.instances.lock().await.insert(
            id.clone(),
            MockInstance {
                request: request.clone(),
                state: "running".to_string(),
                endpoint: self.default_endpoint.clone(),
            },
        );

        Ok(id)
    }

    async fn describe(
        &self,
        _config: &ProviderConfig,
        provider_instance_id: &str,
    ) -> Result<InstanceDescription> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = &self.failures.lock().await.describe {
            return Err(error.clone());
        }

        let instances = self.instances.lock().await;
        let instance = instances
            .get(provider_instance_id)
            .ok_or_else(|| GatewayError::NotFound(provider_instance_id.to_string()))?;

        Ok(InstanceDescription {
            state: instance.state.clone(),
            running: instance.state == "running",
            endpoint: instance.endpoint.clone(),
        })
    }

    async fn terminate(&self, _config: &ProviderConfig, provider_instance_id: &str) -> Result<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        self.terminated
            .lock()
            .await
            .push(provider_instance_id.to_string());

        if let Some(error) = &self.failures.lock().await.terminate {
            return Err(error.clone());
        }

        let mut instances = self.instances.lock().await;
        match instances.get_mut(provider_instance_id) {
            Some(instance) => {
                instance.state = "terminated".to_string();
                Ok(())
            }
            None => Err(GatewayError::NotFound(provider_instance_id.to_string())),
        }
    }

    async fn list_launchables(&self, _config: &ProviderConfig) -> Result<Launchables> {
        Ok(self.launchables.clone())
    }
}
