//! Keyring failover library
//!
//! Spreads requests to a rate-limited data API across several API keys,
//! tracks each key's health and daily quota, rotates away from rejected
//! keys and retries transient failures with exponential backoff.

// Public modules
pub mod config;
pub mod error;
pub mod logging;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Settings;
pub use error::{ExecutorError, PoolError};
pub use services::{CredentialPool, HttpTransport, RawOutcome, RequestExecutor, RequestSpec};
