// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timeout and retry decorator for compute gateways.
//!
//! Every call is bounded by a timeout. Describe, terminate and list calls are
//! retried on transient failures, timeouts included. A launch is retried only
//! when the provider was never reached: a launch that timed out may still
//! complete remotely, and a second one would leave an untracked instance.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use instancer_core::persistence::ProviderConfig;
use tracing::warn;

use super::traits::*;

/// Timeouts and retry budget applied by [`ResilientGateway`].
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Timeout for launch calls.
    pub launch_timeout: Duration,
    /// Timeout for describe, terminate and list calls.
    pub call_timeout: Duration,
    /// Extra attempts after a transient failure.
    pub max_retries: u32,
    /// Pause before a retry.
    pub retry_backoff: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            launch_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            max_retries: 1,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Gateway wrapper adding timeouts and bounded retries.
pub struct ResilientGateway<G> {
    inner: G,
    config: ResilienceConfig,
}

impl<G: ComputeGateway> ResilientGateway<G> {
    /// Wrap `inner` with the default timeouts.
    pub fn new(inner: G) -> Self {
        Self::with_config(inner, ResilienceConfig::default())
    }

    /// Wrap `inner` with explicit timeouts.
    pub fn with_config(inner: G, config: ResilienceConfig) -> Self {
        Self { inner, config }
    }

    /// The wrapped gateway.
    pub fn inner(&self) -> &G {
        &self.inner
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &str,
        timeout: Duration,
        retryable: fn(&GatewayError) -> bool,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Transient(format!(
                    "{} timed out after {:?}",
                    operation, timeout
                ))),
            };

            match outcome {
                Err(e) if retryable(&e) && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(operation, attempt, error = %e, "Transient provider failure, retrying");
                    if !self.config.retry_backoff.is_zero() {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<G: ComputeGateway> ComputeGateway for ResilientGateway<G> {
    fn provider_type(&self) -> &'static str {
        self.inner.provider_type()
    }

    async fn launch(&self, config: &ProviderConfig, request: &LaunchRequest) -> Result<String> {
        self.call("launch", self.config.launch_timeout, GatewayError::is_unsent, || {
            self.inner.launch(config, request)
        })
        .await
    }

    async fn describe(
        &self,
        config: &ProviderConfig,
        provider_instance_id: &str,
    ) -> Result<InstanceDescription> {
        self.call("describe", self.config.call_timeout, GatewayError::is_transient, || {
            self.inner.describe(config, provider_instance_id)
        })
        .await
    }

    async fn terminate(&self, config: &ProviderConfig, provider_instance_id: &str) -> Result<()> {
        self.call("terminate", self.config.call_timeout, GatewayError::is_transient, || {
            self.inner.terminate(config, provider_instance_id)
        })
        .await
    }

    async fn list_launchables(&self, config: &ProviderConfig) -> Result<Launchables> {
        self.call(
            "list_launchables",
            self.config.call_timeout,
            GatewayError::is_transient,
            || self.inner.list_launchables(config),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use instancer_core::OwnerId;

    fn config() -> ProviderConfig {
        ProviderConfig {
            region: "mock-1".to_string(),
            endpoint: "http://mock".to_string(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            default_instance_size: None,
            default_security_group: None,
            default_subnet_id: None,
            default_key_name: None,
        }
    }

    fn request() -> LaunchRequest {
        LaunchRequest {
            challenge_id: "web-1".to_string(),
            owner_id: OwnerId::from("u1"),
            image_id: "img-1".to_string(),
            instance_size: None,
            subnet_id: None,
            security_group: None,
            key_name: None,
            user_data: String::new(),
        }
    }

    fn fast() -> ResilienceConfig {
        ResilienceConfig {
            launch_timeout: Duration::from_millis(200),
            call_timeout: Duration::from_millis(200),
            max_retries: 1,
            retry_backoff: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_unreachable_launch_is_retried_once() {
        let mock = MockGateway::new();
        mock.push_launch_failure(GatewayError::Unreachable("connection refused".into()))
            .await;
        let gateway = ResilientGateway::with_config(mock, fast());

        let id = gateway.launch(&config(), &request()).await.unwrap();
        assert!(id.starts_with("i-mock-"));
        assert_eq!(gateway.inner().launch_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let mock = MockGateway::failing(GatewayError::Unreachable("outage".into()));
        let gateway = ResilientGateway::with_config(mock, fast());

        let err = gateway.launch(&config(), &request()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(gateway.inner().launch_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_launch_is_not_retried() {
        let mock = MockGateway::new();
        mock.push_launch_failure(GatewayError::Transient("502 Bad Gateway".into()))
            .await;
        let gateway = ResilientGateway::with_config(mock, fast());

        let err = gateway.launch(&config(), &request()).await.unwrap_err();
        assert_eq!(err, GatewayError::Transient("502 Bad Gateway".into()));
        assert_eq!(gateway.inner().launch_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let mock = MockGateway::failing(GatewayError::Rejected("bad image".into()));
        let gateway = ResilientGateway::with_config(mock, fast());

        let err = gateway.launch(&config(), &request()).await.unwrap_err();
        assert_eq!(err, GatewayError::Rejected("bad image".into()));
        assert_eq!(gateway.inner().launch_count(), 1);
    }

    #[tokio::test]
    async fn test_launch_timeout_is_transient_and_not_repeated() {
        let mut mock = MockGateway::new();
        mock.launch_delay = Duration::from_secs(5);
        let gateway = ResilientGateway::with_config(mock, fast());

        let err = gateway.launch(&config(), &request()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!err.is_unsent());
        assert_eq!(gateway.inner().launch_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_terminate_is_retried() {
        let mock = MockGateway::new();
        let id = mock.launch(&config(), &request()).await.unwrap();
        mock.set_terminate_failure(Some(GatewayError::Transient("throttled".into())))
            .await;
        let gateway = ResilientGateway::with_config(mock, fast());

        let err = gateway.terminate(&config(), &id).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(gateway.inner().terminate_count(), 2);
    }
}
