// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! REST compute gateway.
//!
//! Talks to a provider exposing region-scoped JSON resources:
//!
//! ```text
//! POST   {endpoint}/v1/regions/{region}/instances          launch
//! GET    {endpoint}/v1/regions/{region}/instances/{id}     describe
//! DELETE {endpoint}/v1/regions/{region}/instances/{id}     terminate
//! GET    {endpoint}/v1/regions/{region}/images?tag=...     launchable images
//! GET    {endpoint}/v1/regions/{region}/subnets
//! GET    {endpoint}/v1/regions/{region}/security-groups
//! ```
//!
//! Requests authenticate with HTTP basic auth (access key id and secret) plus
//! an optional session token header.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use instancer_core::persistence::ProviderConfig;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::*;

/// Header carrying temporary-credential session tokens.
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

#[derive(Debug, Serialize)]
struct CreateInstanceRequest<'a> {
    image_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_size: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subnet_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    security_group: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_name: Option<&'a str>,
    user_data: String,
    tags: BTreeMap<&'static str, String>,
}

#[derive(Debug, Deserialize)]
struct CreatedInstance {
    id: String,
}

#[derive(Debug, Deserialize)]
struct InstanceView {
    state: String,
    #[serde(default)]
    public_ip: Option<String>,
    #[serde(default)]
    public_dns: Option<String>,
    #[serde(default)]
    private_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceView {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

impl From<ResourceView> for LaunchableResource {
    fn from(view: ResourceView) -> Self {
        Self {
            id: view.id,
            name: view.name,
            description: view.description,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageList {
    images: Vec<ResourceView>,
}

#[derive(Debug, Deserialize)]
struct SubnetList {
    subnets: Vec<ResourceView>,
}

#[derive(Debug, Deserialize)]
struct SecurityGroupList {
    security_groups: Vec<ResourceView>,
}

/// Compute gateway backed by a REST provider API.
#[derive(Debug, Clone, Default)]
pub struct HttpComputeGateway {
    client: reqwest::Client,
}

impl HttpComputeGateway {
    /// Create a gateway with a default HTTP client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a gateway reusing an existing HTTP client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url(config: &ProviderConfig, path: &str) -> String {
        format!(
            "{}/v1/regions/{}{}",
            config.endpoint.trim_end_matches('/'),
            config.region,
            path
        )
    }

    fn authorize(&self, builder: RequestBuilder, config: &ProviderConfig) -> Result<RequestBuilder> {
        let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key)
        else {
            return Err(GatewayError::Unauthorized(
                "provider credentials are not configured".to_string(),
            ));
        };

        let mut builder = builder.basic_auth(key_id, Some(secret));
        if let Some(token) = &config.session_token {
            builder = builder.header(SESSION_TOKEN_HEADER, token);
        }
        Ok(builder)
    }

    async fn send(&self, builder: RequestBuilder, config: &ProviderConfig) -> Result<Response> {
        let response = self
            .authorize(builder, config)?
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn get_json<T: DeserializeOwned>(&self, config: &ProviderConfig, path: &str) -> Result<T> {
        let response = self
            .send(self.client.get(Self::url(config, path)), config)
            .await?;
        response.json().await.map_err(classify_transport)
    }
}

/// Map a non-success HTTP status to the gateway error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    match status.as_u16() {
        401 | 403 => GatewayError::Unauthorized(detail),
        404 => GatewayError::NotFound(detail),
        400 | 409 | 422 => GatewayError::Rejected(detail),
        408 | 429 => GatewayError::Transient(detail),
        code if code >= 500 => GatewayError::Transient(detail),
        _ => GatewayError::Other(detail),
    }
}

fn classify_transport(err: reqwest::Error) -> GatewayError {
    if err.is_connect() {
        GatewayError::Unreachable(err.to_string())
    } else if err.is_timeout() {
        GatewayError::Transient(err.to_string())
    } else {
        GatewayError::Other(err.to_string())
    }
}

#[async_trait]
impl ComputeGateway for HttpComputeGateway {
    fn provider_type(&self) -> &'static str {
        "http"
    }

    async fn launch(&self, config: &ProviderConfig, request: &LaunchRequest) -> Result<String> {
        let mut tags = BTreeMap::new();
        tags.insert(MANAGED_TAG, "true".to_string());
        tags.insert(CHALLENGE_TAG, request.challenge_id.clone());
        tags.insert(OWNER_TAG, request.owner_id.to_string());

        let body = CreateInstanceRequest {
            image_id: &request.image_id,
            instance_size: request.instance_size.as_deref(),
            subnet_id: request.subnet_id.as_deref(),
            security_group: request.security_group.as_deref(),
            key_name: request.key_name.as_deref(),
            user_data: BASE64.encode(request.user_data.as_bytes()),
            tags,
        };

        let response = self
            .send(
                self.client.post(Self::url(config, "/instances")).json(&body),
                config,
            )
            .await?;
        let created: CreatedInstance = response.json().await.map_err(classify_transport)?;

        debug!(
            provider_instance_id = %created.id,
            challenge_id = %request.challenge_id,
            "Provider accepted launch"
        );
        Ok(created.id)
    }

    async fn describe(
        &self,
        config: &ProviderConfig,
        provider_instance_id: &str,
    ) -> Result<InstanceDescription> {
        let view: InstanceView = self
            .get_json(config, &format!("/instances/{}", provider_instance_id))
            .await?;

        Ok(InstanceDescription {
            running: view.state == "running",
            endpoint: view.public_ip.or(view.public_dns).or(view.private_ip),
            state: view.state,
        })
    }

    async fn terminate(&self, config: &ProviderConfig, provider_instance_id: &str) -> Result<()> {
        let url = Self::url(config, &format!("/instances/{}", provider_instance_id));
        self.send(self.client.delete(url), config).await?;
        Ok(())
    }

    async fn list_launchables(&self, config: &ProviderConfig) -> Result<Launchables> {
        let images: ImageList = self
            .get_json(config, &format!("/images?tag={}", CHALLENGE_TAG))
            .await?;
        let subnets: SubnetList = self.get_json(config, "/subnets").await?;
        let groups: SecurityGroupList = self.get_json(config, "/security-groups").await?;

        Ok(Launchables {
            images: images
                .images
                .into_iter()
                .filter(|image| image.tags.contains_key(CHALLENGE_TAG))
                .map(Into::into)
                .collect(),
            subnets: subnets.subnets.into_iter().map(Into::into).collect(),
            security_groups: groups.security_groups.into_iter().map(Into::into).collect(),
        })
    }
}
