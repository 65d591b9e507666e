//! Backend Pool Module
//!
//! This module tracks the health of every configured API key and decides
//! which one to use for each outbound request.
//!
//! # Features
//! - Per-key health record with healthy / faulty / invalid / quota-exceeded states
//! - Healthy-first selection with round-robin among equally healthy keys
//! - Daily request budget per key, reset on the next UTC calendar day
//! - Masked, serializable health snapshots for observability
//!
//! # Example
//! ```ignore
//! use keyring_failover::services::backend_pool::{CredentialPool, HealthThresholds, Outcome};
//!
//! let pool = CredentialPool::new(vec!["key-one", "key-two"], HealthThresholds::default())?;
//!
//! let key = pool.acquire()?;
//! // ... send the request with key.expose() ...
//! pool.report(&key, Outcome::Success)?;
//! ```

mod clock;
mod credential;
mod pool;
mod strategy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{
    mask_key, Credential, CredentialHealth, CredentialHealthView, HealthStatus, HealthThresholds,
};
pub use pool::{CredentialPool, Outcome, PoolStats};
