//! Credential Pool Implementation
//!
//! This module provides the `CredentialPool` that owns every credential's
//! health record, hands out the best usable credential per request and
//! records request outcomes.

use super::clock::{Clock, SystemClock};
use super::credential::{
    Credential, CredentialHealth, CredentialHealthView, HealthStatus, HealthThresholds,
};
use super::strategy::{candidate_order, RoundRobinCursor};
use crate::error::PoolError;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// ============================================================================
// Outcome
// ============================================================================

/// Result of one request made with a credential, as reported to the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure { reason: String },
}

impl Outcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Credential Pool
// ============================================================================

#[derive(Debug)]
struct PoolState {
    records: Vec<CredentialHealth>,
    cursor: RoundRobinCursor,
}

/// A pool of credentials with health tracking and rotation
///
/// All reads and writes of the health counters and the rotation cursor go
/// through one mutex, so concurrent callers can share the pool behind an
/// `Arc`. No method performs I/O.
#[derive(Debug)]
pub struct CredentialPool {
    state: Mutex<PoolState>,
    thresholds: HealthThresholds,
    clock: Arc<dyn Clock>,
}

impl CredentialPool {
    /// Create a pool over the given keys using the system clock
    pub fn new<I, S>(keys: I, thresholds: HealthThresholds) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_clock(keys, thresholds, Arc::new(SystemClock))
    }

    /// Create a pool with an explicit time source.
    ///
    /// Keys are trimmed; blank and duplicate entries are dropped while the
    /// configured order is kept.
    pub fn with_clock<I, S>(
        keys: I,
        thresholds: HealthThresholds,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let today = clock.today();
        let mut seen = HashSet::new();
        let records: Vec<CredentialHealth> = keys
            .into_iter()
            .map(|key| key.into().trim().to_string())
            .filter(|key| !key.is_empty() && seen.insert(key.clone()))
            .map(|key| CredentialHealth::new(Credential::new(key), thresholds, today))
            .collect();

        if records.is_empty() {
            return Err(PoolError::Empty);
        }

        tracing::info!(
            credentials = records.len(),
            consecutive_failure_threshold = thresholds.consecutive_failure_threshold,
            total_failure_threshold = thresholds.total_failure_threshold,
            daily_limit = thresholds.daily_limit,
            "Initialized credential pool"
        );

        Ok(Self {
            state: Mutex::new(PoolState {
                records,
                cursor: RoundRobinCursor::new(),
            }),
            thresholds,
            clock,
        })
    }

    /// Hand out the best usable credential and count one request against it.
    ///
    /// Healthy credentials are preferred over faulty ones; ties are broken by
    /// the round-robin cursor. A candidate whose daily quota is reached by
    /// this request is skipped in favour of the next one.
    pub fn acquire(&self) -> Result<Credential, PoolError> {
        self.acquire_excluding(&HashSet::new())
    }

    /// Like [`acquire`](Self::acquire), but never hands out a credential in
    /// `excluded`. Excluded candidates are not charged any usage.
    pub fn acquire_excluding(&self, excluded: &HashSet<Credential>) -> Result<Credential, PoolError> {
        let today = self.clock.today();
        let mut state = self.lock();
        let total = state.records.len();

        for record in state.records.iter_mut() {
            if record.roll_window(today) {
                tracing::debug!(
                    credential = %record.credential(),
                    status = %record.status(),
                    "Daily usage window rolled over"
                );
            }
        }

        let statuses: Vec<HealthStatus> = state.records.iter().map(|r| r.status()).collect();
        let order = candidate_order(&statuses, state.cursor.position());
        if order.is_empty() {
            return Err(PoolError::NoUsableCredential { total });
        }
        state.cursor.advance(total);

        for idx in order {
            let record = &mut state.records[idx];
            if excluded.contains(record.credential()) {
                continue;
            }
            let before = record.status();
            if record.record_usage(today) {
                return Ok(record.credential().clone());
            }
            log_transition(record, before);
        }

        if excluded.is_empty() {
            tracing::warn!(credentials = total, "No usable credential left for today");
        }
        Err(PoolError::NoUsableCredential { total })
    }

    /// Record the outcome of a request made with `credential`
    pub fn report(&self, credential: &Credential, outcome: Outcome) -> Result<HealthStatus, PoolError> {
        let now = self.clock.now();
        let mut state = self.lock();
        let total = state.records.len();

        let record = find_mut(&mut state.records, credential)?;
        let before = record.status();
        let after = match outcome {
            Outcome::Success => record.report_success(now),
            Outcome::Failure { reason } => record.report_failure(reason, now),
        };
        log_transition(record, before);

        // Move the cursor off a key that just degraded
        if after == HealthStatus::Faulty && before != HealthStatus::Faulty {
            state.cursor.advance(total);
        }
        Ok(after)
    }

    /// Count one more request against a specific credential, e.g. when the
    /// same credential is retried after a backoff delay.
    ///
    /// Returns `Ok(false)` when the credential must not be used for it.
    pub fn record_usage(&self, credential: &Credential) -> Result<bool, PoolError> {
        let today = self.clock.today();
        let mut state = self.lock();
        let record = find_mut(&mut state.records, credential)?;
        let before = record.status();
        let permitted = record.record_usage(today);
        log_transition(record, before);
        Ok(permitted)
    }

    /// Masked, read-only view of every credential in configured order
    pub fn snapshot(&self) -> Vec<CredentialHealthView> {
        self.lock().records.iter().map(|r| r.view()).collect()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let mut stats = PoolStats {
            total: state.records.len(),
            ..PoolStats::default()
        };
        for record in &state.records {
            match record.status() {
                HealthStatus::Healthy => stats.healthy += 1,
                HealthStatus::Faulty => stats.faulty += 1,
                HealthStatus::Invalid => stats.invalid += 1,
                HealthStatus::QuotaExceeded => stats.quota_exceeded += 1,
            }
        }
        stats
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    /// Get the number of credentials
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Counters stay consistent even if a holder panicked mid-update
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find_mut<'a>(
    records: &'a mut [CredentialHealth],
    credential: &Credential,
) -> Result<&'a mut CredentialHealth, PoolError> {
    records
        .iter_mut()
        .find(|r| r.credential() == credential)
        .ok_or_else(|| {
            tracing::warn!(credential = %credential, "Outcome reported for unknown credential");
            PoolError::UnknownCredential(credential.masked())
        })
}

fn log_transition(record: &CredentialHealth, before: HealthStatus) {
    let after = record.status();
    if after == before {
        return;
    }
    match after {
        HealthStatus::Faulty => tracing::warn!(
            credential = %record.credential(),
            consecutive_failures = record.consecutive_failures(),
            reason = record.last_failure_reason().unwrap_or_default(),
            "Credential marked faulty"
        ),
        HealthStatus::Invalid => tracing::warn!(
            credential = %record.credential(),
            total_failures = record.total_failures(),
            reason = record.last_failure_reason().unwrap_or_default(),
            "Credential permanently disabled for this session"
        ),
        HealthStatus::QuotaExceeded => tracing::warn!(
            credential = %record.credential(),
            daily_used = record.daily_used(),
            "Credential reached its daily request limit"
        ),
        HealthStatus::Healthy => tracing::debug!(
            credential = %record.credential(),
            previous = %before,
            "Credential recovered"
        ),
    }
}

// ============================================================================
// Pool Statistics
// ============================================================================

/// Statistics about a credential pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
    pub faulty: usize,
    pub invalid: usize,
    pub quota_exceeded: usize,
}

impl PoolStats {
    /// Number of credentials that can currently be handed out
    pub fn usable(&self) -> usize {
        self.healthy + self.faulty
    }

    /// Check if the pool is healthy (at least one credential available)
    pub fn is_healthy(&self) -> bool {
        self.usable() > 0
    }
}

// ============================================================================
// Tests
// ============================================================================
