// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for instancer-environment.

use std::time::Duration;

use instancer_core::persistence::ProviderConfig;

use crate::gateway::ResilienceConfig;
use crate::reclaim_scheduler::ReclaimSchedulerConfig;
use crate::secret::{DEFAULT_SECRET_LENGTH, SecretPolicy};

/// Environment configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL for the tracking database
    pub database_url: String,
    /// Interval between reclamation sweeps
    pub sweep_interval: Duration,
    /// Whether expired instances are reclaimed automatically
    pub auto_reclaim_enabled: bool,
    /// Age after which an unfinished reservation is discarded
    pub stale_reservation_after: Duration,
    /// Timeout for provider launch calls
    pub launch_timeout: Duration,
    /// Timeout for the other provider calls
    pub call_timeout: Duration,
    /// Length of generated secrets
    pub secret_length: usize,
    /// Provider configuration to store at startup, if `INSTANCER_PROVIDER_*` is set
    pub seed_provider: Option<ProviderConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("INSTANCER_DATABASE_URL")
            .ok_or(ConfigError::MissingEnvVar("INSTANCER_DATABASE_URL"))?;

        let secs = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs)
                    .ok_or(ConfigError::InvalidValue(key, value)),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let sweep_interval = secs("INSTANCER_SWEEP_INTERVAL_SECS", 30)?;
        let stale_reservation_after = secs("INSTANCER_STALE_RESERVATION_SECS", 600)?;
        let launch_timeout = secs("INSTANCER_LAUNCH_TIMEOUT_SECS", 30)?;
        let call_timeout = secs("INSTANCER_CALL_TIMEOUT_SECS", 10)?;

        let auto_reclaim_enabled = lookup("INSTANCER_AUTO_RECLAIM_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let secret_length = match lookup("INSTANCER_SECRET_LENGTH") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue("INSTANCER_SECRET_LENGTH", value))?,
            None => DEFAULT_SECRET_LENGTH,
        };

        let seed_provider = provider_from_lookup(&lookup);

        Ok(Self {
            database_url,
            sweep_interval,
            auto_reclaim_enabled,
            stale_reservation_after,
            launch_timeout,
            call_timeout,
            secret_length,
            seed_provider,
        })
    }

    /// Scheduler settings derived from this configuration.
    pub fn scheduler(&self) -> ReclaimSchedulerConfig {
        ReclaimSchedulerConfig {
            poll_interval: self.sweep_interval,
            enabled: self.auto_reclaim_enabled,
            stale_reservation_after: self.stale_reservation_after,
        }
    }

    /// Gateway timeouts derived from this configuration.
    pub fn resilience(&self) -> ResilienceConfig {
        ResilienceConfig {
            launch_timeout: self.launch_timeout,
            call_timeout: self.call_timeout,
            ..ResilienceConfig::default()
        }
    }

    /// Secret policy derived from this configuration.
    pub fn secret_policy(&self) -> SecretPolicy {
        SecretPolicy::new(self.secret_length)
    }
}

fn provider_from_lookup<F>(lookup: &F) -> Option<ProviderConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| {
        lookup(format!("INSTANCER_PROVIDER_{}", name).as_str()).filter(|v| !v.trim().is_empty())
    };

    let region = var("REGION")?;
    let endpoint = var("ENDPOINT")?;

    Some(ProviderConfig {
        region,
        endpoint,
        access_key_id: var("ACCESS_KEY_ID"),
        secret_access_key: var("SECRET_ACCESS_KEY"),
        session_token: var("SESSION_TOKEN"),
        default_instance_size: var("DEFAULT_INSTANCE_SIZE"),
        default_security_group: var("DEFAULT_SECURITY_GROUP"),
        default_subnet_id: var("DEFAULT_SUBNET_ID"),
        default_key_name: var("DEFAULT_KEY_NAME"),
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable could not be parsed.
    #[error("Invalid value for {0}: '{1}'")]
    InvalidValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::from_lookup(lookup(&[("INSTANCER_DATABASE_URL", "postgres://db")])).unwrap();

        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert!(config.auto_reclaim_enabled);
        assert_eq!(config.stale_reservation_after, Duration::from_secs(600));
        assert_eq!(config.launch_timeout, Duration::from_secs(30));
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert_eq!(config.secret_length, DEFAULT_SECRET_LENGTH);
        assert!(config.seed_provider.is_none());
    }

    #[test]
    fn test_missing_database_url() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("INSTANCER_DATABASE_URL")));
    }

    #[test]
    fn test_invalid_interval() {
        let err = Config::from_lookup(lookup(&[
            ("INSTANCER_DATABASE_URL", "postgres://db"),
            ("INSTANCER_SWEEP_INTERVAL_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue("INSTANCER_SWEEP_INTERVAL_SECS", _)));
    }

    #[test]
    fn test_auto_reclaim_can_be_disabled() {
        let config = Config::from_lookup(lookup(&[
            ("INSTANCER_DATABASE_URL", "postgres://db"),
            ("INSTANCER_AUTO_RECLAIM_ENABLED", "false"),
        ]))
        .unwrap();
        assert!(!config.auto_reclaim_enabled);
        assert!(!config.scheduler().enabled);
    }

    #[test]
    fn test_provider_seed_requires_region_and_endpoint() {
        let config = Config::from_lookup(lookup(&[
            ("INSTANCER_DATABASE_URL", "postgres://db"),
            ("INSTANCER_PROVIDER_REGION", "eu-north-1"),
            ("INSTANCER_PROVIDER_ACCESS_KEY_ID", "AKIA"),
        ]))
        .unwrap();
        assert!(config.seed_provider.is_none());

        let config = Config::from_lookup(lookup(&[
            ("INSTANCER_DATABASE_URL", "postgres://db"),
            ("INSTANCER_PROVIDER_REGION", "eu-north-1"),
            ("INSTANCER_PROVIDER_ENDPOINT", "https://compute.example"),
            ("INSTANCER_PROVIDER_ACCESS_KEY_ID", "AKIA"),
            ("INSTANCER_PROVIDER_SECRET_ACCESS_KEY", "secret"),
        ]))
        .unwrap();
        let provider = config.seed_provider.unwrap();
        assert_eq!(provider.region, "eu-north-1");
        assert!(provider.has_credentials());
        assert!(provider.session_token.is_none());
    }

    #[test]
    fn test_secret_length_is_clamped_by_policy() {
        let config = Config::from_lookup(lookup(&[
            ("INSTANCER_DATABASE_URL", "postgres://db"),
            ("INSTANCER_SECRET_LENGTH", "8"),
        ]))
        .unwrap();
        assert_eq!(config.secret_policy().length(), 16);
    }
}
