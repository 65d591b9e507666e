//! Utility modules
//!
//! Contains retry pacing shared by the request executor.

pub mod retry;

pub use retry::{presets, BackoffPolicy};
