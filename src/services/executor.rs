//! Request executor
//!
//! Drives one logical request across two independent recovery tracks:
//!
//! - credential rejections (401/403/429) are reported to the pool and the
//!   request moves to another credential immediately;
//! - transient failures (timeouts, 5xx) are retried on the same credential
//!   after an exponential backoff delay, without touching its health.
//!
//! Callers only ever see the final outcome or one escalated error.

use crate::error::{ExecutorError, PoolError};
use crate::services::backend_pool::{Credential, CredentialHealthView, CredentialPool, Outcome};
use crate::services::transport::{RawOutcome, RequestSpec, Transport, TransportErrorKind};
use crate::utils::retry::BackoffPolicy;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

// ============================================================================
// Outcome Classification
// ============================================================================

/// How a single attempt's raw outcome should be handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success,
    /// Upstream or network hiccup; retry the same credential after a delay
    Retryable(String),
    /// Attributable to the credential; report it and rotate
    CredentialRejected(String),
    /// Neither retryable nor the credential's fault
    Terminal(String),
}

/// Map a raw transport outcome to its handling class
pub fn classify(outcome: &RawOutcome) -> Classification {
    match outcome {
        RawOutcome::HttpResponse { status, .. } => match *status {
            200..=299 => Classification::Success,
            401 | 403 => {
                Classification::CredentialRejected(format!("HTTP {}: authentication failed", status))
            }
            429 => Classification::CredentialRejected(format!("HTTP {}: too many requests", status)),
            408 => Classification::Retryable(format!("HTTP {}: request timeout", status)),
            500..=599 => Classification::Retryable(format!("HTTP {}: server error", status)),
            404 => Classification::Terminal(format!("HTTP {}: resource not found", status)),
            400..=499 => Classification::Terminal(format!("HTTP {}: client error", status)),
            _ => Classification::Terminal(format!("HTTP {}: unexpected status", status)),
        },
        RawOutcome::TransportError { kind, message } => match kind {
            TransportErrorKind::InvalidRequest => {
                Classification::Terminal(format!("{}: {}", kind, message))
            }
            _ => Classification::Retryable(format!("{}: {}", kind, message)),
        },
    }
}

// ============================================================================
// Request Executor
// ============================================================================

/// Runs requests through a shared credential pool with rotation and backoff
pub struct RequestExecutor<T: Transport> {
    pool: Arc<CredentialPool>,
    transport: T,
    backoff: BackoffPolicy,
}

impl<T: Transport> RequestExecutor<T> {
    pub fn new(pool: Arc<CredentialPool>, transport: T, backoff: BackoffPolicy) -> Self {
        Self {
            pool,
            transport,
            backoff,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Health of every credential, masked
    pub fn snapshot(&self) -> Vec<CredentialHealthView> {
        self.pool.snapshot()
    }

    /// Execute one logical request
    pub async fn execute(&self, request: &RequestSpec) -> Result<RawOutcome, ExecutorError> {
        self.execute_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Execute one logical request, aborting with `Cancelled` when `cancel`
    /// fires during a backoff wait or an in-flight call
    pub async fn execute_with_cancel(
        &self,
        request: &RequestSpec,
        cancel: &CancellationToken,
    ) -> Result<RawOutcome, ExecutorError> {
        let span = tracing::info_span!(
            "execute",
            request_id = %Uuid::new_v4(),
            endpoint = %request.endpoint,
        );
        self.run(request, cancel).instrument(span).await
    }

    async fn run(
        &self,
        request: &RequestSpec,
        cancel: &CancellationToken,
    ) -> Result<RawOutcome, ExecutorError> {
        // Each credential gets at most one rejection per call
        let mut rejected: HashSet<Credential> = HashSet::new();
        let mut attempts = 0u32;
        let mut transient_failures = 0u32;
        let mut last_reason: Option<String> = None;
        let mut retained: Option<Credential> = None;

        loop {
            let credential = match retained.take() {
                Some(credential) => credential,
                None => self.acquire(&rejected, attempts, last_reason.as_deref())?,
            };

            attempts += 1;
            tracing::debug!(attempt = attempts, credential = %credential, "Sending request");

            let raw = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(attempt = attempts, "Request cancelled in flight");
                    return Err(ExecutorError::Cancelled);
                }
                raw = self.transport.call(&credential, request) => raw,
            };

            match classify(&raw) {
                Classification::Success => {
                    self.pool.report(&credential, Outcome::Success)?;
                    tracing::debug!(attempt = attempts, credential = %credential, "Request succeeded");
                    return Ok(raw);
                }
                Classification::CredentialRejected(reason) => {
                    let status = self
                        .pool
                        .report(&credential, Outcome::failure(reason.clone()))?;
                    tracing::warn!(
                        attempt = attempts,
                        credential = %credential,
                        status = %status,
                        reason = %reason,
                        "Credential rejected by upstream"
                    );
                    rejected.insert(credential);
                    last_reason = Some(reason);
                }
                Classification::Retryable(reason) => {
                    transient_failures += 1;
                    let Some(delay) = self.backoff.next_delay(transient_failures) else {
                        tracing::warn!(attempts, reason = %reason, "Retries exhausted");
                        return Err(ExecutorError::RetriesExhausted {
                            attempts,
                            last_reason: reason,
                        });
                    };

                    tracing::debug!(
                        attempt = attempts,
                        retry = transient_failures,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Retrying after transient failure"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            tracing::info!(attempt = attempts, "Request cancelled during backoff");
                            return Err(ExecutorError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    // The retry is another request against the same key's quota
                    if self.pool.record_usage(&credential)? {
                        retained = Some(credential);
                    } else {
                        tracing::info!(credential = %credential, "Daily quota reached, switching credential for retry");
                    }
                    last_reason = Some(reason);
                }
                Classification::Terminal(reason) => {
                    tracing::debug!(attempt = attempts, reason = %reason, "Non-retryable failure");
                    return Err(ExecutorError::NonRetryable {
                        reason,
                        outcome: raw,
                    });
                }
            }
        }
    }

    fn acquire(
        &self,
        rejected: &HashSet<Credential>,
        attempts: u32,
        last_reason: Option<&str>,
    ) -> Result<Credential, ExecutorError> {
        match self.pool.acquire_excluding(rejected) {
            Ok(credential) => Ok(credential),
            Err(err @ PoolError::NoUsableCredential { .. }) if rejected.is_empty() => {
                tracing::warn!(error = %err, "No usable credential");
                Err(ExecutorError::NoUsableCredential(err))
            }
            Err(PoolError::NoUsableCredential { .. }) => Err(ExecutorError::AllCredentialsExhausted {
                attempts,
                last_reason: last_reason
                    .unwrap_or("no usable credential left")
                    .to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend_pool::{HealthStatus, HealthThresholds, ManualClock};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted outcomes and records which key each call used
    struct ScriptedTransport {
        script: Mutex<VecDeque<RawOutcome>>,
        fallback: RawOutcome,
        calls: Mutex<Vec<String>>,
        cancel_on_call: Option<CancellationToken>,
        latency: Option<Duration>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<RawOutcome>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: RawOutcome::http(200, "{}"),
                calls: Mutex::new(Vec::new()),
                cancel_on_call: None,
                latency: None,
            }
        }

        fn always(outcome: RawOutcome) -> Self {
            let mut transport = Self::new(Vec::new());
            transport.fallback = outcome;
            transport
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn call(&self, credential: &Credential, _request: &RequestSpec) -> RawOutcome {
            self.calls.lock().unwrap().push(credential.expose().to_string());
            if let Some(token) = &self.cancel_on_call {
                token.cancel();
            }
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::new()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(0.0)
            .with_max_attempts(3)
    }

    fn pool(keys: &[&str]) -> Arc<CredentialPool> {
        pool_with(keys, HealthThresholds::default())
    }

    fn pool_with(keys: &[&str], thresholds: HealthThresholds) -> Arc<CredentialPool> {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        Arc::new(CredentialPool::with_clock(keys.iter().copied(), thresholds, clock).unwrap())
    }

    fn spec() -> RequestSpec {
        RequestSpec::new("hsrl/ssjy").with_param("code", "000001")
    }

    #[test]
    fn test_classify_http_statuses() {
        assert_eq!(classify(&RawOutcome::http(200, "")), Classification::Success);
        assert_eq!(classify(&RawOutcome::http(204, "")), Classification::Success);
        for status in [401, 403, 429] {
            assert!(matches!(
                classify(&RawOutcome::http(status, "")),
                Classification::CredentialRejected(_)
            ));
        }
        for status in [408, 500, 502, 503] {
            assert!(matches!(
                classify(&RawOutcome::http(status, "")),
                Classification::Retryable(_)
            ));
        }
        for status in [301, 400, 404, 422] {
            assert!(matches!(
                classify(&RawOutcome::http(status, "")),
                Classification::Terminal(_)
            ));
        }
    }

    #[test]
    fn test_classify_transport_errors() {
        let timeout = RawOutcome::transport_error(TransportErrorKind::Timeout, "operation timed out");
        assert_eq!(
            classify(&timeout),
            Classification::Retryable("timeout: operation timed out".to_string())
        );
        let malformed = RawOutcome::transport_error(TransportErrorKind::MalformedResponse, "eof");
        assert!(matches!(classify(&malformed), Classification::Retryable(_)));
        let invalid = RawOutcome::transport_error(TransportErrorKind::InvalidRequest, "bad url");
        assert!(matches!(classify(&invalid), Classification::Terminal(_)));
    }

    #[tokio::test]
    async fn test_success_reports_to_pool() {
        let pool = pool(&["key-aaaaaaaa"]);
        let executor = RequestExecutor::new(pool.clone(), ScriptedTransport::new(vec![]), fast_backoff());

        let outcome = executor.execute(&spec()).await.unwrap();
        assert_eq!(outcome, RawOutcome::http(200, "{}"));

        let view = &executor.snapshot()[0];
        assert_eq!(view.total_successes, 1);
        assert_eq!(view.daily_used, 1);
    }

    #[tokio::test]
    async fn test_rejection_rotates_to_next_credential() {
        let pool = pool(&["key-aaaaaaaa", "key-bbbbbbbb"]);
        let transport = ScriptedTransport::new(vec![RawOutcome::http(401, "invalid licence")]);
        let executor = RequestExecutor::new(pool.clone(), transport, fast_backoff());

        let outcome = executor.execute(&spec()).await.unwrap();
        assert_eq!(outcome.status(), Some(200));
        assert_eq!(executor.transport.calls(), vec!["key-aaaaaaaa", "key-bbbbbbbb"]);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot[0].total_failures, 1);
        assert_eq!(snapshot[0].last_failure_reason.as_deref(), Some("HTTP 401: authentication failed"));
        assert_eq!(snapshot[1].total_successes, 1);
    }

    #[tokio::test]
    async fn test_rotation_exhausted_across_all_credentials() {
        let pool = pool(&["key-aaaaaaaa", "key-bbbbbbbb"]);
        let transport = ScriptedTransport::always(RawOutcome::http(429, ""));
        let executor = RequestExecutor::new(pool.clone(), transport, fast_backoff());

        let err = executor.execute(&spec()).await.unwrap_err();
        match err {
            ExecutorError::AllCredentialsExhausted { attempts, last_reason } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_reason, "HTTP 429: too many requests");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(executor.transport.calls(), vec!["key-aaaaaaaa", "key-bbbbbbbb"]);
    }

    #[tokio::test]
    async fn test_rejected_credential_not_retried_within_call() {
        let pool = pool(&["key-aaaaaaaa", "key-bbbbbbbb", "key-cccccccc"]);
        let invalid = Credential::new("key-cccccccc");
        for _ in 0..10 {
            pool.report(&invalid, Outcome::failure("HTTP 401")).unwrap();
        }
        // Park the cursor past the end of the two-key healthy tier
        pool.acquire().unwrap();
        assert_eq!(pool.stats().invalid, 1);

        let transport = ScriptedTransport::always(RawOutcome::http(401, ""));
        let executor = RequestExecutor::new(pool.clone(), transport, fast_backoff());

        let err = executor.execute(&spec()).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::AllCredentialsExhausted { attempts: 2, .. }
        ));

        let mut calls = executor.transport.calls();
        calls.sort();
        assert_eq!(calls, vec!["key-aaaaaaaa", "key-bbbbbbbb"]);

        let failures: Vec<u32> = pool.snapshot().iter().map(|v| v.total_failures).collect();
        assert_eq!(failures, vec![1, 1, 10]);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_same_credential() {
        let pool = pool(&["key-aaaaaaaa", "key-bbbbbbbb"]);
        let transport = ScriptedTransport::new(vec![
            RawOutcome::http(503, "busy"),
            RawOutcome::transport_error(TransportErrorKind::Timeout, "timed out"),
        ]);
        let executor = RequestExecutor::new(pool.clone(), transport, fast_backoff());

        let outcome = executor.execute(&spec()).await.unwrap();
        assert_eq!(outcome.status(), Some(200));
        assert_eq!(
            executor.transport.calls(),
            vec!["key-aaaaaaaa", "key-aaaaaaaa", "key-aaaaaaaa"]
        );

        // Transient failures are not held against the credential
        let view = &pool.snapshot()[0];
        assert_eq!(view.total_failures, 0);
        assert_eq!(view.daily_used, 3);
        assert_eq!(view.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let pool = pool(&["key-aaaaaaaa"]);
        let transport = ScriptedTransport::always(RawOutcome::http(502, "bad gateway"));
        let executor = RequestExecutor::new(pool.clone(), transport, fast_backoff());

        let err = executor.execute(&spec()).await.unwrap_err();
        match err {
            ExecutorError::RetriesExhausted { attempts, last_reason } => {
                // First try plus three backoff retries
                assert_eq!(attempts, 4);
                assert_eq!(last_reason, "HTTP 502: server error");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pool.snapshot()[0].total_failures, 0);
    }

    #[tokio::test]
    async fn test_no_retry_policy_fails_fast() {
        let pool = pool(&["key-aaaaaaaa"]);
        let transport = ScriptedTransport::always(RawOutcome::http(500, ""));
        let executor = RequestExecutor::new(pool, transport, crate::utils::presets::no_retry());
        assert_eq!(executor.backoff().max_attempts, 0);
        assert_eq!(executor.pool().len(), 1);

        let err = executor.execute(&spec()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::RetriesExhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_terminal_failure_propagates_untouched() {
        let pool = pool(&["key-aaaaaaaa", "key-bbbbbbbb"]);
        let transport = ScriptedTransport::new(vec![RawOutcome::http(404, "no such stock")]);
        let executor = RequestExecutor::new(pool.clone(), transport, fast_backoff());

        let err = executor.execute(&spec()).await.unwrap_err();
        match err {
            ExecutorError::NonRetryable { reason, outcome } => {
                assert_eq!(reason, "HTTP 404: resource not found");
                assert_eq!(outcome, RawOutcome::http(404, "no such stock"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(executor.transport.calls().len(), 1);
        let snapshot = pool.snapshot();
        assert!(snapshot.iter().all(|v| v.total_failures == 0 && v.total_successes == 0));
    }

    #[tokio::test]
    async fn test_no_usable_credential_up_front() {
        let pool = pool(&["key-aaaaaaaa"]);
        let key = Credential::new("key-aaaaaaaa");
        for _ in 0..10 {
            pool.report(&key, Outcome::failure("HTTP 401")).unwrap();
        }
        let executor = RequestExecutor::new(pool, ScriptedTransport::new(vec![]), fast_backoff());

        let err = executor.execute(&spec()).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::NoUsableCredential(PoolError::NoUsableCredential { total: 1 })
        ));
        assert!(executor.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_faulty_single_credential_still_executes() {
        let pool = pool(&["key-aaaaaaaa"]);
        let key = Credential::new("key-aaaaaaaa");
        for _ in 0..4 {
            assert_eq!(
                pool.report(&key, Outcome::failure("HTTP 403")).unwrap(),
                HealthStatus::Healthy
            );
        }
        assert_eq!(
            pool.report(&key, Outcome::failure("HTTP 403")).unwrap(),
            HealthStatus::Faulty
        );

        let executor = RequestExecutor::new(pool.clone(), ScriptedTransport::new(vec![]), fast_backoff());
        assert!(executor.execute(&spec()).await.is_ok());
        assert_eq!(pool.snapshot()[0].status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_leaves_health_alone() {
        let pool = pool(&["key-aaaaaaaa"]);
        let token = CancellationToken::new();
        let mut transport = ScriptedTransport::always(RawOutcome::http(503, ""));
        transport.cancel_on_call = Some(token.clone());
        let backoff = fast_backoff()
            .with_base_delay(Duration::from_secs(60))
            .with_max_delay(Duration::from_secs(60));
        let executor = RequestExecutor::new(pool.clone(), transport, backoff);

        let err = executor.execute_with_cancel(&spec(), &token).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
        assert_eq!(executor.transport.calls().len(), 1);

        let view = &pool.snapshot()[0];
        assert_eq!(view.total_failures, 0);
        assert_eq!(view.total_successes, 0);
    }

    #[tokio::test]
    async fn test_cancel_during_inflight_call_leaves_health_alone() {
        let pool = pool(&["key-aaaaaaaa"]);
        let mut transport = ScriptedTransport::new(vec![]);
        transport.latency = Some(Duration::from_secs(60));
        let executor = RequestExecutor::new(pool.clone(), transport, fast_backoff());

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };

        let err = executor.execute_with_cancel(&spec(), &token).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, ExecutorError::Cancelled));
        assert_eq!(executor.transport.calls().len(), 1);

        let view = &executor.snapshot()[0];
        assert_eq!(view.total_failures, 0);
        assert_eq!(view.total_successes, 0);
    }

    #[tokio::test]
    async fn test_quota_reached_during_retry_switches_credential() {
        let pool = pool_with(
            &["key-aaaaaaaa", "key-bbbbbbbb"],
            HealthThresholds::default().with_daily_limit(2),
        );
        let transport = ScriptedTransport::new(vec![RawOutcome::http(500, "")]);
        let executor = RequestExecutor::new(pool.clone(), transport, fast_backoff());

        assert!(executor.execute(&spec()).await.is_ok());
        assert_eq!(executor.transport.calls(), vec!["key-aaaaaaaa", "key-bbbbbbbb"]);
        assert_eq!(pool.snapshot()[0].status, HealthStatus::QuotaExceeded);
    }

    #[tokio::test]
    async fn test_concurrent_executions_share_pool() {
        let pool = pool(&["key-aaaaaaaa", "key-bbbbbbbb"]);
        let executor = Arc::new(RequestExecutor::new(
            pool.clone(),
            ScriptedTransport::new(vec![]),
            fast_backoff(),
        ));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let executor = Arc::clone(&executor);
                tokio::spawn(async move { executor.execute(&spec()).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        let snapshot = pool.snapshot();
        assert_eq!(snapshot[0].total_successes, 10);
        assert_eq!(snapshot[1].total_successes, 10);
    }

    #[tokio::test]
    async fn test_day_rollover_restores_exhausted_pool() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 23, 0, 0).unwrap(),
        ));
        let pool = Arc::new(
            CredentialPool::with_clock(
                ["key-aaaaaaaa"],
                HealthThresholds::default().with_daily_limit(2),
                clock.clone(),
            )
            .unwrap(),
        );
        let executor = RequestExecutor::new(pool.clone(), ScriptedTransport::new(vec![]), fast_backoff());

        assert!(executor.execute(&spec()).await.is_ok());
        let err = executor.execute(&spec()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NoUsableCredential(_)));

        clock.advance(ChronoDuration::hours(2));
        assert!(executor.execute(&spec()).await.is_ok());
        assert_eq!(pool.snapshot()[0].daily_used, 1);
    }
}
