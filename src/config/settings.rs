//! Application settings and configuration
//!
//! This module provides configuration management for the application,
//! loading settings from environment variables with sensible defaults.
//! Every variable is prefixed with `KEYRING_`.

use crate::logging::LogFormat;
use crate::services::backend_pool::{Credential, HealthThresholds};
use crate::utils::retry::BackoffPolicy;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "KEYRING_";

/// Backoff settings for transient failures
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: 5,
        }
    }
}

impl RetrySettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new()
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.multiplier)
            .with_jitter(self.jitter)
            .with_max_attempts(self.max_retries)
    }
}

/// Main application settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    // App settings
    pub app_name: String,
    pub app_version: String,
    pub log_level: String,
    pub log_format: LogFormat,

    // Credentials, in configured order
    #[serde(skip)]
    pub api_keys: Vec<Credential>,

    // Upstream
    pub base_url: String,
    pub request_timeout_secs: u64,

    // Credential health
    pub thresholds: HealthThresholds,

    // Backoff
    pub retry: RetrySettings,
}

impl Settings {
    /// Load settings from environment variables with defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_source(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source (the process
    /// environment in production, a map in tests)
    pub fn from_source<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let settings = Self {
            app_name: env_or_default(&lookup, "APP_NAME", &defaults.app_name),
            app_version: defaults.app_version,
            log_level: env_or_default(&lookup, "LOG_LEVEL", &defaults.log_level),
            log_format: parse_var(&lookup, "LOG_FORMAT", defaults.log_format)?,

            api_keys: parse_keys(&env_or_default(&lookup, "API_KEYS", "")),

            base_url: env_or_default(&lookup, "BASE_URL", &defaults.base_url),
            request_timeout_secs: parse_var(
                &lookup,
                "TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,

            thresholds: HealthThresholds {
                consecutive_failure_threshold: parse_var(
                    &lookup,
                    "CONSECUTIVE_FAILURES",
                    defaults.thresholds.consecutive_failure_threshold,
                )?,
                total_failure_threshold: parse_var(
                    &lookup,
                    "TOTAL_FAILURES",
                    defaults.thresholds.total_failure_threshold,
                )?,
                daily_limit: parse_var(&lookup, "DAILY_LIMIT", defaults.thresholds.daily_limit)?,
            },

            retry: RetrySettings {
                base_delay_ms: parse_var(
                    &lookup,
                    "RETRY_BASE_DELAY_MS",
                    defaults.retry.base_delay_ms,
                )?,
                max_delay_ms: parse_var(
                    &lookup,
                    "RETRY_MAX_DELAY_MS",
                    defaults.retry.max_delay_ms,
                )?,
                multiplier: parse_var(&lookup, "RETRY_MULTIPLIER", defaults.retry.multiplier)?,
                jitter: parse_var(&lookup, "RETRY_JITTER", defaults.retry.jitter)?,
                max_retries: parse_var(&lookup, "MAX_RETRIES", defaults.retry.max_retries)?,
            },
        };

        settings.validate()?;

        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.api_keys.is_empty() {
            anyhow::bail!("{}API_KEYS must contain at least one key", ENV_PREFIX);
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            anyhow::bail!("Base URL must start with http:// or https://: {}", self.base_url);
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("Request timeout must be > 0");
        }

        if self.thresholds.consecutive_failure_threshold == 0
            || self.thresholds.total_failure_threshold == 0
        {
            anyhow::bail!("Failure thresholds must be > 0");
        }
        if self.thresholds.daily_limit == 0 {
            anyhow::bail!("Daily limit must be > 0");
        }

        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            anyhow::bail!("Retry multiplier must be >= 1.0");
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            anyhow::bail!("Retry jitter must be in [0.0, 1.0)");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("Retry base delay must not exceed max delay");
        }

        Ok(())
    }

    /// Accepted but suspicious settings, for the caller to log once tracing
    /// is initialized
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.thresholds.consecutive_failure_threshold > self.thresholds.total_failure_threshold {
            warnings.push(format!(
                "Consecutive failure threshold ({}) exceeds total ({}); keys will go invalid before faulty",
                self.thresholds.consecutive_failure_threshold,
                self.thresholds.total_failure_threshold
            ));
        }
        warnings
    }

    /// Client-side timeout for one upstream call
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "keyring-failover".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            api_keys: Vec::new(),
            base_url: "http://api.biyingapi.com".to_string(),
            request_timeout_secs: 30,
            thresholds: HealthThresholds::default(),
            retry: RetrySettings::default(),
        }
    }
}

/// Helper function to get a prefixed variable with default
fn env_or_default<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(&format!("{}{}", ENV_PREFIX, key))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parse a prefixed variable, falling back to `default` when unset
fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Into<anyhow::Error>,
{
    let name = format!("{}{}", ENV_PREFIX, key);
    match lookup(&name).map(|value| value.trim().to_string()) {
        Some(value) if !value.is_empty() => value.parse::<T>().map_err(|err| {
            let err: anyhow::Error = err.into();
            err.context(format!("Invalid {} value: {}", name, value))
        }),
        _ => Ok(default),
    }
}

fn parse_keys(raw: &str) -> Vec<Credential> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(Credential::new)
        .collect()
}
