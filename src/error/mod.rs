//! Error types
//!
//! Pool-level and executor-level failures surfaced to callers.

mod types;

pub use types::{ExecutorError, PoolError};
