//! Opaque cloud API calls.
//!
//! Everything above this module treats an API call as "fallible, possibly
//! throttled, possibly slow". The seams are two traits:
//!
//! - [`Transport`] sends one [`ApiRequest`] and returns the decoded JSON
//!   response or an [`ApiError`].
//! - [`Connector`] builds a transport for a service and region under a given
//!   [`ClientConfig`](crate::parallel::ClientConfig), so retry, timeout and
//!   pool settings are applied where the SDK clients are built.
//!
//! The real implementation lives in [`sdk`](crate::aws::sdk).
//! [`StaticConnector`] hands one shared transport to every client and backs
//! the in-process fakes used by tests.

use crate::parallel::client::{ClientConfig, ConfigError};
use crate::parallel::errors::{classify_code, ErrorCategory};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Region used when a request carries none.
pub const DEFAULT_REGION: &str = "us-east-1";

/// One API call: service, region, operation name and JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub service: String,
    pub region: Option<String>,
    pub operation: String,
    pub payload: Value,
}

/// Error returned by a cloud API call.
///
/// `code` is the provider's structured error code (for example
/// `ThrottlingException`); classification keys on it first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub status: Option<u16>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Raised lazily, on first use, for services with no SDK client.
    pub fn unknown_service(service: &str) -> Self {
        Self::new(
            "UnknownService",
            format!("no API client is available for service '{}'", service),
        )
    }

    /// Classify this error by HTTP status first, then by code.
    pub fn category(&self) -> ErrorCategory {
        match self.status {
            Some(429) => return ErrorCategory::Throttling,
            Some(s) if s >= 500 => {
                // a 5xx carrying a throttling code is still throttling
                return match classify_code(&self.code) {
                    ErrorCategory::Throttling => ErrorCategory::Throttling,
                    _ => ErrorCategory::Transient,
                };
            }
            _ => {}
        }

        match classify_code(&self.code) {
            ErrorCategory::Unknown => match self.status {
                Some(401) | Some(403) => ErrorCategory::AccessDenied,
                Some(404) => ErrorCategory::NotFound,
                _ => ErrorCategory::Unknown,
            },
            category => category,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

/// Fallback error code when a failed response carries none.
pub fn default_code_for_status(status: u16) -> &'static str {
    match status {
        400 => "BadRequest",
        401 | 403 => "AccessDenied",
        404 => "NotFound",
        429 => "TooManyRequestsException",
        s if s >= 500 => "ServiceUnavailable",
        _ => "UnknownError",
    }
}

/// Sends one API request and returns the decoded response.
pub trait Transport: Send + Sync {
    fn send(&self, request: &ApiRequest) -> Result<Value, ApiError>;
}

impl<F> Transport for F
where
    F: Fn(&ApiRequest) -> Result<Value, ApiError> + Send + Sync,
{
    fn send(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        self(request)
    }
}

/// Builds a transport configured for one client.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        service: &str,
        region: Option<&str>,
        config: &ClientConfig,
    ) -> Result<Arc<dyn Transport>, ConfigError>;
}

/// Hands out the same transport for every client configuration.
pub struct StaticConnector {
    transport: Arc<dyn Transport>,
}

impl StaticConnector {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl Connector for StaticConnector {
    fn connect(
        &self,
        _service: &str,
        _region: Option<&str>,
        _config: &ClientConfig,
    ) -> Result<Arc<dyn Transport>, ConfigError> {
        Ok(Arc::clone(&self.transport))
    }
}
