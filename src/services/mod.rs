//! Services module
//!
//! Credential health tracking, the outbound transport and the request
//! executor that ties them together.

pub mod backend_pool;
pub mod executor;
pub mod transport;

pub use backend_pool::{
    Credential, CredentialHealthView, CredentialPool, HealthStatus, HealthThresholds, Outcome,
    PoolStats,
};
pub use executor::{classify, Classification, RequestExecutor};
pub use transport::{HttpTransport, RawOutcome, RequestSpec, Transport, TransportErrorKind};
