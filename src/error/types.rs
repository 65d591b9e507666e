//! Pool and executor error types

use crate::services::transport::RawOutcome;
use thiserror::Error;

/// Errors raised by the credential pool
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("No credentials configured")]
    Empty,

    #[error("No usable credential: all {total} credential(s) are invalid or over today's quota")]
    NoUsableCredential { total: usize },

    /// Carries the masked form of the credential
    #[error("Unknown credential: {0}")]
    UnknownCredential(String),
}

/// Errors that escape one `RequestExecutor::execute` call.
///
/// Individual attempt failures are absorbed by rotation and backoff; only
/// the escalated kinds below reach the caller.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("No usable credential available")]
    NoUsableCredential(#[source] PoolError),

    #[error("All credentials exhausted after {attempts} attempt(s): {last_reason}")]
    AllCredentialsExhausted { attempts: u32, last_reason: String },

    #[error("Retries exhausted after {attempts} attempt(s): {last_reason}")]
    RetriesExhausted { attempts: u32, last_reason: String },

    #[error("Non-retryable failure: {reason}")]
    NonRetryable { reason: String, outcome: RawOutcome },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Credential pool error: {0}")]
    Pool(#[from] PoolError),
}

impl ExecutorError {
    /// Whether waiting (for a quota rollover or a recovering backend) could help
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            ExecutorError::NoUsableCredential(_)
                | ExecutorError::AllCredentialsExhausted { .. }
                | ExecutorError::RetriesExhausted { .. }
        )
    }
}
