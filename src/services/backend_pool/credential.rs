//! Credential types and health tracking
//!
//! This module defines the opaque `Credential` secret and the per-credential
//! `CredentialHealth` record together with its status transition rules.
//! Everything here is pure state: no clocks are read and nothing is logged,
//! the owning pool supplies timestamps and reports transitions.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Credential
// ============================================================================

/// An opaque API key identifying one account/quota bucket upstream.
///
/// `Display` and `Debug` only ever render the masked prefix; the raw secret
/// must be requested explicitly through [`Credential::expose`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Arc::from(secret.into()))
    }

    /// The raw secret, for building the outbound request only
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Masked form safe for logs and snapshots
    pub fn masked(&self) -> String {
        mask_key(&self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.masked()).finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Mask a key for logging: first 8 characters followed by `...`.
/// Keys of 8 characters or fewer are fully hidden.
pub fn mask_key(key: &str) -> String {
    match key.char_indices().nth(8) {
        Some((idx, _)) => format!("{}...", &key[..idx]),
        None => "***".to_string(),
    }
}

// ============================================================================
// Health Status
// ============================================================================

/// Reliability state of a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// Too many consecutive failures; still usable but deprioritized
    Faulty,
    /// Too many total failures; never used again this session
    Invalid,
    /// Daily request budget spent; usable again on the next calendar day
    QuotaExceeded,
}

impl HealthStatus {
    /// Whether a credential in this state may be handed out
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Healthy | Self::Faulty)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Faulty => write!(f, "faulty"),
            Self::Invalid => write!(f, "invalid"),
            Self::QuotaExceeded => write!(f, "quota_exceeded"),
        }
    }
}

// ============================================================================
// Thresholds
// ============================================================================

/// Limits that drive the status transitions of every credential in a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthThresholds {
    /// Consecutive failures before a credential is marked faulty
    pub consecutive_failure_threshold: u32,
    /// Total failures before a credential is permanently invalid
    pub total_failure_threshold: u32,
    /// Requests allowed per credential per calendar day
    pub daily_limit: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 5,
            total_failure_threshold: 10,
            daily_limit: 200,
        }
    }
}

impl HealthThresholds {
    pub fn with_consecutive_failures(mut self, threshold: u32) -> Self {
        self.consecutive_failure_threshold = threshold;
        self
    }

    pub fn with_total_failures(mut self, threshold: u32) -> Self {
        self.total_failure_threshold = threshold;
        self
    }

    pub fn with_daily_limit(mut self, limit: u32) -> Self {
        self.daily_limit = limit;
        self
    }
}

// ============================================================================
// Credential Health
// ============================================================================

/// Mutable reliability record for a single credential
#[derive(Debug, Clone)]
pub struct CredentialHealth {
    credential: Credential,
    thresholds: HealthThresholds,
    status: HealthStatus,
    consecutive_failures: u32,
    total_failures: u32,
    total_successes: u64,
    daily_used: u32,
    window_start: NaiveDate,
    last_failure_reason: Option<String>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

impl CredentialHealth {
    /// Create a fresh, healthy record whose usage window starts on `today`
    pub fn new(credential: Credential, thresholds: HealthThresholds, today: NaiveDate) -> Self {
        Self {
            credential,
            thresholds,
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            daily_used: 0,
            window_start: today,
            last_failure_reason: None,
            last_failure_at: None,
            last_success_at: None,
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_failures(&self) -> u32 {
        self.total_failures
    }

    pub fn daily_used(&self) -> u32 {
        self.daily_used
    }

    pub fn window_start(&self) -> NaiveDate {
        self.window_start
    }

    pub fn last_failure_reason(&self) -> Option<&str> {
        self.last_failure_reason.as_deref()
    }

    /// Requests left in the current daily window
    pub fn remaining_requests(&self) -> u32 {
        self.thresholds.daily_limit.saturating_sub(self.daily_used)
    }

    pub fn is_usable(&self) -> bool {
        self.status.is_usable()
    }

    pub fn is_disabled(&self) -> bool {
        self.status == HealthStatus::Invalid
    }

    /// Record a failed request and return the resulting status.
    ///
    /// `Invalid` wins over everything and is absorbing. A credential that is
    /// over quota keeps that status; its faultiness is re-derived when the
    /// daily window rolls over.
    pub fn report_failure(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> HealthStatus {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures = self.total_failures.saturating_add(1);
        self.last_failure_reason = Some(reason.into());
        self.last_failure_at = Some(at);

        self.status = match self.status {
            HealthStatus::Invalid => HealthStatus::Invalid,
            _ if self.total_failures >= self.thresholds.total_failure_threshold => {
                HealthStatus::Invalid
            }
            HealthStatus::QuotaExceeded => HealthStatus::QuotaExceeded,
            _ if self.consecutive_failures >= self.thresholds.consecutive_failure_threshold => {
                HealthStatus::Faulty
            }
            current => current,
        };
        self.status
    }

    /// Record a successful request and return the resulting status
    pub fn report_success(&mut self, at: DateTime<Utc>) -> HealthStatus {
        self.consecutive_failures = 0;
        self.total_successes = self.total_successes.saturating_add(1);
        self.last_success_at = Some(at);

        if self.status.is_usable() {
            self.status = HealthStatus::Healthy;
        }
        self.status
    }

    /// Reset the daily counter if `today` is a different calendar day than
    /// the current window. Returns true when a rollover happened.
    pub fn roll_window(&mut self, today: NaiveDate) -> bool {
        if today == self.window_start {
            return false;
        }
        self.daily_used = 0;
        self.window_start = today;
        if self.status == HealthStatus::QuotaExceeded {
            self.status = self.status_from_failures();
        }
        true
    }

    /// Count one request against today's budget.
    ///
    /// Returns false when the request must not be sent with this credential:
    /// it is invalid, was already at its limit, or this request reached it.
    pub fn record_usage(&mut self, today: NaiveDate) -> bool {
        self.roll_window(today);

        if self.status == HealthStatus::Invalid {
            return false;
        }
        if self.daily_used >= self.thresholds.daily_limit {
            self.status = HealthStatus::QuotaExceeded;
            return false;
        }

        self.daily_used += 1;
        if self.daily_used >= self.thresholds.daily_limit {
            self.status = HealthStatus::QuotaExceeded;
            return false;
        }
        true
    }

    /// Read-only projection with the secret masked
    pub fn view(&self) -> CredentialHealthView {
        CredentialHealthView {
            credential: self.credential.masked(),
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            daily_used: self.daily_used,
            daily_limit: self.thresholds.daily_limit,
            remaining_requests: self.remaining_requests(),
            window_start: self.window_start,
            last_failure_reason: self.last_failure_reason.clone(),
            last_failure_at: self.last_failure_at,
            last_success_at: self.last_success_at,
        }
    }

    fn status_from_failures(&self) -> HealthStatus {
        if self.total_failures >= self.thresholds.total_failure_threshold {
            HealthStatus::Invalid
        } else if self.consecutive_failures >= self.thresholds.consecutive_failure_threshold {
            HealthStatus::Faulty
        } else {
            HealthStatus::Healthy
        }
    }
}

// ============================================================================
// Observability View
// ============================================================================

/// Snapshot of one credential's health, safe to log or serialize
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialHealthView {
    pub credential: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub total_failures: u32,
    pub total_successes: u64,
    pub daily_used: u32,
    pub daily_limit: u32,
    pub remaining_requests: u32,
    pub window_start: NaiveDate,
    pub last_failure_reason: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Tests
// ============================================================================
