// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for instancer-environment.

use instancer_core::CoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::GatewayError;

/// Environment errors raised while starting or wiring the service.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Core persistence operation failed.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using Environment Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level classification of a [`LifecycleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The owner already holds an instance.
    AlreadyActive,
    /// No matching record, template or instance.
    NotFound,
    /// The requester may not act on the record.
    Forbidden,
    /// Provider credentials missing or refused.
    ProviderUnauthorized,
    /// Temporary provider failure; the caller may retry.
    ProviderTransient,
    /// Provider refused the request.
    ProviderRejected,
    /// Provider no longer knows the instance.
    ProviderNotFound,
    /// Unclassified provider failure.
    Provider,
    /// No provider configuration stored.
    ConfigurationMissing,
    /// The challenge template cannot be launched as stored.
    InvalidTemplate,
    /// Persistence failure.
    Store,
}

/// Errors returned by lifecycle manager operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LifecycleError {
    /// The owner already holds an instance (possibly of another challenge).
    #[error("Owner already has an active instance of challenge '{challenge_id}'")]
    AlreadyActive {
        /// Challenge of the existing instance.
        challenge_id: String,
        /// Provider handle of the existing instance, absent while it is launching.
        provider_instance_id: Option<String>,
    },

    /// No matching record, template or instance.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requester is neither the owner nor an admin.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Provider credentials missing or refused.
    #[error("Provider rejected credentials: {0}")]
    ProviderUnauthorized(String),

    /// Temporary provider failure.
    #[error("Provider temporarily unavailable: {0}")]
    ProviderTransient(String),

    /// Provider refused the request.
    #[error("Provider rejected request: {0}")]
    ProviderRejected(String),

    /// Provider no longer knows the instance.
    #[error("Provider has no such instance: {0}")]
    ProviderNotFound(String),

    /// Unclassified provider failure.
    #[error("Provider error: {0}")]
    Provider(String),

    /// No provider configuration has been stored.
    #[error("Provider configuration missing: {0}")]
    ConfigurationMissing(String),

    /// The challenge template cannot be launched as stored.
    #[error("Invalid challenge template: {0}")]
    InvalidTemplate(String),

    /// Persistence failure.
    #[error("Store error: {0}")]
    Store(#[from] CoreError),
}

impl LifecycleError {
    /// Classification for API responses.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyActive { .. } => ErrorKind::AlreadyActive,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::ProviderUnauthorized(_) => ErrorKind::ProviderUnauthorized,
            Self::ProviderTransient(_) => ErrorKind::ProviderTransient,
            Self::ProviderRejected(_) => ErrorKind::ProviderRejected,
            Self::ProviderNotFound(_) => ErrorKind::ProviderNotFound,
            Self::Provider(_) => ErrorKind::Provider,
            Self::ConfigurationMissing(_) => ErrorKind::ConfigurationMissing,
            Self::InvalidTemplate(_) => ErrorKind::InvalidTemplate,
            Self::Store(_) => ErrorKind::Store,
        }
    }

    /// Stable error code string.
    pub fn error_code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::AlreadyActive => "ALREADY_ACTIVE",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::ProviderUnauthorized => "PROVIDER_UNAUTHORIZED",
            ErrorKind::ProviderTransient => "PROVIDER_TRANSIENT",
            ErrorKind::ProviderRejected => "PROVIDER_REJECTED",
            ErrorKind::ProviderNotFound => "PROVIDER_NOT_FOUND",
            ErrorKind::Provider => "PROVIDER_ERROR",
            ErrorKind::ConfigurationMissing => "CONFIGURATION_MISSING",
            ErrorKind::InvalidTemplate => "INVALID_TEMPLATE",
            ErrorKind::Store => "STORE_ERROR",
        }
    }
}

impl From<GatewayError> for LifecycleError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unauthorized(msg) => Self::ProviderUnauthorized(msg),
            GatewayError::NotFound(msg) => Self::ProviderNotFound(msg),
            GatewayError::Transient(msg) | GatewayError::Unreachable(msg) => {
                Self::ProviderTransient(msg)
            }
            GatewayError::Rejected(msg) => Self::ProviderRejected(msg),
            GatewayError::Other(msg) => Self::Provider(msg),
        }
    }
}
