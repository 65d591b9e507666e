//! Transport layer for upstream API calls
//!
//! The executor never talks HTTP itself. It hands a credential and a
//! `RequestSpec` to a `Transport` and gets back a `RawOutcome`, which is
//! either an HTTP response (any status) or a transport-level error.

use crate::services::backend_pool::Credential;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Request / Outcome Types
// ============================================================================

/// Endpoint-agnostic description of one logical request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestSpec {
    /// Path below the base URL, e.g. `hslt/list`
    pub endpoint: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
}

impl RequestSpec {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            query: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Kind of failure below the HTTP layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    /// Response arrived but its body could not be read or decoded
    MalformedResponse,
    /// The request could not be built; retrying will not help
    InvalidRequest,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Connect => write!(f, "connection error"),
            Self::MalformedResponse => write!(f, "malformed response"),
            Self::InvalidRequest => write!(f, "invalid request"),
            Self::Other => write!(f, "transport error"),
        }
    }
}

/// What came back from one transport call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawOutcome {
    HttpResponse { status: u16, body: String },
    TransportError { kind: TransportErrorKind, message: String },
}

impl RawOutcome {
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::HttpResponse {
            status,
            body: body.into(),
        }
    }

    pub fn transport_error(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::TransportError {
            kind,
            message: message.into(),
        }
    }

    /// HTTP status, if a response was received
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpResponse { status, .. } => Some(*status),
            Self::TransportError { .. } => None,
        }
    }

    /// Map a reqwest failure. The URL is stripped from the message because
    /// it carries the credential.
    fn from_reqwest_error(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_builder() {
            TransportErrorKind::InvalidRequest
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::MalformedResponse
        } else {
            TransportErrorKind::Other
        };
        Self::transport_error(kind, err.without_url().to_string())
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Performs one outbound call with a given credential
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, credential: &Credential, request: &RequestSpec) -> RawOutcome;
}

// ============================================================================
// HTTP Transport
// ============================================================================

/// `reqwest`-backed transport for APIs that take the key as the last path
/// segment: `{base_url}/{endpoint}/{key}`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, credential: &Credential, request: &RequestSpec) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            request.endpoint.trim_matches('/'),
            credential.expose()
        )
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, credential: &Credential, request: &RequestSpec) -> RawOutcome {
        let url = self.url_for(credential, request);

        tracing::debug!(
            endpoint = %request.endpoint,
            credential = %credential,
            "Calling upstream API"
        );

        let response = match self.client.get(&url).query(&request.query).send().await {
            Ok(response) => response,
            Err(err) => return RawOutcome::from_reqwest_error(err),
        };

        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => RawOutcome::http(status, body),
            Err(err) => RawOutcome::from_reqwest_error(err),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
