// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute gateway trait definitions.
//!
//! Defines the abstract interface to the remote compute provider.

use async_trait::async_trait;
use instancer_core::OwnerId;
use instancer_core::persistence::{ChallengeTemplate, ProviderConfig};
use serde::Serialize;
use thiserror::Error;

/// Tag key marking instances launched by this system.
pub const MANAGED_TAG: &str = "instancer-managed";

/// Tag key carrying the challenge id on launched instances and on images.
pub const CHALLENGE_TAG: &str = "instancer-challenge";

/// Tag key carrying the owner id on launched instances.
pub const OWNER_TAG: &str = "instancer-owner";

/// Errors from gateway operations, classified by how callers should react.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum GatewayError {
    /// Credentials were missing or refused.
    #[error("Provider rejected credentials: {0}")]
    Unauthorized(String),

    /// The provider does not know the instance or resource.
    #[error("Provider resource not found: {0}")]
    NotFound(String),

    /// Temporary failure (timeout, throttling, provider outage). The provider
    /// may or may not have acted on the request.
    #[error("Transient provider failure: {0}")]
    Transient(String),

    /// The provider could not be reached; no request was delivered.
    #[error("Provider unreachable: {0}")]
    Unreachable(String),

    /// The provider refused the request as invalid or unsatisfiable.
    #[error("Provider rejected request: {0}")]
    Rejected(String),

    /// Anything else.
    #[error("Provider error: {0}")]
    Other(String),
}

impl GatewayError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Unreachable(_))
    }

    /// Whether the provider certainly did not act on the request.
    pub fn is_unsent(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Everything needed to launch one challenge instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Challenge being launched, recorded as a tag.
    pub challenge_id: String,
    /// Owner the instance is for, recorded as a tag.
    pub owner_id: OwnerId,
    /// Machine image.
    pub image_id: String,
    /// Instance size.
    pub instance_size: Option<String>,
    /// Subnet.
    pub subnet_id: Option<String>,
    /// Security group.
    pub security_group: Option<String>,
    /// Key pair.
    pub key_name: Option<String>,
    /// Bootstrap payload, plain text. Gateways encode it as the provider expects.
    pub user_data: String,
}

impl LaunchRequest {
    /// Build a request from a template, filling unset fields from the
    /// provider defaults.
    pub fn from_template(
        template: &ChallengeTemplate,
        config: &ProviderConfig,
        owner_id: &OwnerId,
        user_data: String,
    ) -> Self {
        let or_default = |value: &Option<String>, default: &Option<String>| {
            value.clone().or_else(|| default.clone())
        };

        Self {
            challenge_id: template.challenge_id.clone(),
            owner_id: owner_id.clone(),
            image_id: template.image_id.clone(),
            instance_size: or_default(&template.instance_size, &config.default_instance_size),
            subnet_id: or_default(&template.subnet_id, &config.default_subnet_id),
            security_group: or_default(&template.security_group, &config.default_security_group),
            key_name: or_default(&template.key_name, &config.default_key_name),
            user_data,
        }
    }
}

/// Provider-side view of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceDescription {
    /// Provider state name (`pending`, `running`, `stopped`, ...).
    pub state: String,
    /// Whether the provider reports the instance as running.
    pub running: bool,
    /// Reachable address, once one is assigned.
    pub endpoint: Option<String>,
}

/// A launchable resource offered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchableResource {
    /// Provider id.
    pub id: String,
    /// Human-readable name.
    pub name: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
}

/// Resources an administrator can pick from when creating a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Launchables {
    /// Images carrying the challenge tag.
    pub images: Vec<LaunchableResource>,
    /// Subnets.
    pub subnets: Vec<LaunchableResource>,
    /// Security groups.
    pub security_groups: Vec<LaunchableResource>,
}

/// Adapter over the remote compute provider.
///
/// Gateways hold no lifecycle state and never touch the database. The
/// provider configuration is passed on every call so credential changes take
/// effect immediately.
#[async_trait]
pub trait ComputeGateway: Send + Sync {
    /// Gateway type identifier (e.g., "http", "mock").
    fn provider_type(&self) -> &'static str;

    /// Launch an instance and return the provider's handle for it.
    async fn launch(&self, config: &ProviderConfig, request: &LaunchRequest) -> Result<String>;

    /// Report state and endpoint of an instance.
    async fn describe(
        &self,
        config: &ProviderConfig,
        provider_instance_id: &str,
    ) -> Result<InstanceDescription>;

    /// Terminate an instance.
    async fn terminate(&self, config: &ProviderConfig, provider_instance_id: &str) -> Result<()>;

    /// List images, subnets and security groups available for templates.
    async fn list_launchables(&self, config: &ProviderConfig) -> Result<Launchables>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig {
            region: "eu-north-1".to_string(),
            endpoint: "https://compute.example".to_string(),
            access_key_id: Some("AKIA".to_string()),
            secret_access_key: Some("secret".to_string()),
            session_token: None,
            default_instance_size: Some("small".to_string()),
            default_security_group: Some("sg-default".to_string()),
            default_subnet_id: Some("subnet-default".to_string()),
            default_key_name: None,
        }
    }

    fn template() -> ChallengeTemplate {
        ChallengeTemplate {
            challenge_id: "web-1".to_string(),
            image_id: "img-1".to_string(),
            instance_size: Some("large".to_string()),
            subnet_id: None,
            security_group: None,
            key_name: Some("ctf-key".to_string()),
            bootstrap_script: String::new(),
            connection_scheme: "http".to_string(),
            connection_port: Some(80),
            max_lifetime_secs: 1800,
        }
    }

    #[test]
    fn test_launch_request_prefers_template_values() {
        let request =
            LaunchRequest::from_template(&template(), &config(), &OwnerId::from("u1"), "x".into());

        assert_eq!(request.instance_size.as_deref(), Some("large"));
        assert_eq!(request.subnet_id.as_deref(), Some("subnet-default"));
        assert_eq!(request.security_group.as_deref(), Some("sg-default"));
        assert_eq!(request.key_name.as_deref(), Some("ctf-key"));
        assert_eq!(request.image_id, "img-1");
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(GatewayError::Transient("throttled".into()).is_transient());
        assert!(!GatewayError::Rejected("bad image".into()).is_transient());
        assert!(!GatewayError::Unauthorized("denied".into()).is_transient());
    }
}
