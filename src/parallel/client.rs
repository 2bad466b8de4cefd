//! Rate-limited client factory.
//!
//! [`get_client`] turns a [`Target`] and a service name into a [`Client`]
//! configured for many-worker fan-out: SDK retries with backoff, the SDK's
//! adaptive client-side rate limiter, and a connection gate sized for the
//! worker count.
//!
//! Configuration problems are reported synchronously as [`ConfigError`].
//! Problems the factory cannot know about, such as a misspelled service
//! name, surface on the first call as an [`ApiError`].
//!
//! # Usage
//!
//! ```no_run
//! use aws_audit_tools::parallel::{get_client, ClientConfigOverrides, RetryMode, Target};
//! # fn demo(target: &Target) -> anyhow::Result<()> {
//! let overrides = ClientConfigOverrides::new()
//!     .max_attempts(3)
//!     .retry_mode(RetryMode::Standard);
//! let client = get_client(target, "service-quotas", Some(&overrides))?;
//! let payload = serde_json::json!({"ServiceCode": "ec2"});
//! let page = client.call("ListServiceQuotas", payload)?;
//! # Ok(())
//! # }
//! ```

use crate::aws::api::{ApiError, ApiRequest, Transport};
use crate::aws::session::Session;
use crate::parallel::types::Target;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_MODE: RetryMode = RetryMode::Adaptive;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_POOL_CONNECTIONS: usize = 25;
/// Upper bound on a single retry delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(20);

/// Initial backoff of [`RetryMode::Legacy`].
pub const LEGACY_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Errors in client configuration, raised when the client is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("service name must not be empty")]
    EmptyServiceName,

    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("max_pool_connections must be at least 1")]
    InvalidPoolSize,

    #[error("{0} must be greater than zero")]
    InvalidTimeout(&'static str),

    #[error("max_workers must be between 1 and {max}, got {value}")]
    InvalidWorkers { value: usize, max: usize },

    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(&'static str),

    #[error("unknown retry mode '{0}' (expected legacy, standard or adaptive)")]
    InvalidRetryMode(String),
}

/// Backoff strategy applied between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryMode {
    /// Exponential backoff from a 50ms base.
    Legacy,
    /// SDK standard mode: jittered exponential backoff from 1s.
    Standard,
    /// Standard backoff plus the SDK's client-side send-rate limiter.
    Adaptive,
}

impl RetryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryMode::Legacy => "legacy",
            RetryMode::Standard => "standard",
            RetryMode::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for RetryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" => Ok(RetryMode::Legacy),
            "standard" => Ok(RetryMode::Standard),
            "adaptive" => Ok(RetryMode::Adaptive),
            other => Err(ConfigError::InvalidRetryMode(other.to_string())),
        }
    }
}

/// Per-client configuration.
///
/// `max_pool_connections` should be at least the number of workers sharing
/// the client; see [`ClientConfig::check_pool_for_workers`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub max_attempts: u32,
    pub retry_mode: RetryMode,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_pool_connections: usize,
    pub max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_mode: DEFAULT_RETRY_MODE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_pool_connections: DEFAULT_MAX_POOL_CONNECTIONS,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl ClientConfig {
    /// New config with every field the overrides set replaced.
    #[must_use]
    pub fn merge(&self, overrides: &ClientConfigOverrides) -> ClientConfig {
        ClientConfig {
            max_attempts: overrides.max_attempts.unwrap_or(self.max_attempts),
            retry_mode: overrides.retry_mode.unwrap_or(self.retry_mode),
            connect_timeout: overrides.connect_timeout.unwrap_or(self.connect_timeout),
            read_timeout: overrides.read_timeout.unwrap_or(self.read_timeout),
            max_pool_connections: overrides
                .max_pool_connections
                .unwrap_or(self.max_pool_connections),
            max_backoff: overrides.max_backoff.unwrap_or(self.max_backoff),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts);
        }
        if self.max_pool_connections == 0 {
            return Err(ConfigError::InvalidPoolSize);
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("connect_timeout"));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("read_timeout"));
        }
        Ok(())
    }

    /// Warn when fewer pooled connections than workers are configured.
    ///
    /// Workers sharing an undersized client wait on each other for a
    /// connection. Returns the warning text, also logged.
    pub fn check_pool_for_workers(&self, workers: usize) -> Option<String> {
        if self.max_pool_connections >= workers {
            return None;
        }
        let message = format!(
            "max_pool_connections ({}) is smaller than the worker count ({}); \
             workers sharing one client will wait for connections",
            self.max_pool_connections, workers
        );
        tracing::warn!("{}", message);
        Some(message)
    }

    /// SDK retry settings for this configuration.
    ///
    /// `max_attempts` counts the first try. The SDK backs off exponentially
    /// with jitter, capped at `max_backoff`.
    pub fn sdk_retry_config(&self) -> RetryConfig {
        let base = match self.retry_mode {
            RetryMode::Adaptive => RetryConfig::adaptive(),
            RetryMode::Standard => RetryConfig::standard(),
            RetryMode::Legacy => {
                RetryConfig::standard().with_initial_backoff(LEGACY_INITIAL_BACKOFF)
            }
        };
        base.with_max_attempts(self.max_attempts)
            .with_max_backoff(self.max_backoff)
    }

    /// SDK timeouts: connect and per-attempt read.
    pub fn sdk_timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .build()
    }
}

/// Caller-supplied overrides; `None` keeps the default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientConfigOverrides {
    pub max_attempts: Option<u32>,
    pub retry_mode: Option<RetryMode>,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub max_pool_connections: Option<usize>,
    pub max_backoff: Option<Duration>,
}

impl ClientConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_attempts(mut self, value: u32) -> Self {
        self.max_attempts = Some(value);
        self
    }

    #[must_use]
    pub fn retry_mode(mut self, value: RetryMode) -> Self {
        self.retry_mode = Some(value);
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = Some(value);
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, value: Duration) -> Self {
        self.read_timeout = Some(value);
        self
    }

    #[must_use]
    pub fn max_pool_connections(mut self, value: usize) -> Self {
        self.max_pool_connections = Some(value);
        self
    }

    #[must_use]
    pub fn max_backoff(mut self, value: Duration) -> Self {
        self.max_backoff = Some(value);
        self
    }
}

/// Counting gate standing in for the HTTP connection pool.
///
/// Each in-flight request holds one permit; callers beyond the capacity
/// block until a permit is released.
#[derive(Debug)]
pub struct ConnectionGate {
    capacity: usize,
    state: Mutex<GateState>,
    available: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    in_flight: usize,
    peak: usize,
}

impl ConnectionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(GateState::default()),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self) -> GatePermit<'_> {
        let mut state = self.lock();
        while state.in_flight >= self.capacity {
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.in_flight += 1;
        state.peak = state.peak.max(state.in_flight);
        GatePermit { gate: self }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Highest number of simultaneous permits observed.
    pub fn peak(&self) -> usize {
        self.lock().peak
    }
}

/// Releases its permit on drop.
pub struct GatePermit<'a> {
    gate: &'a ConnectionGate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.gate.available.notify_one();
    }
}

/// Service client bound to one session and region.
///
/// Cheap to clone; clones share the transport and connection gate, so a
/// client can be handed to several workers.
#[derive(Clone)]
pub struct Client {
    service: String,
    region: Option<String>,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    gate: Arc<ConnectionGate>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("service", &self.service)
            .field("region", &self.region)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection_gate(&self) -> &ConnectionGate {
        &self.gate
    }

    /// Call an operation.
    ///
    /// Throttling and transient failures are retried inside the transport
    /// according to [`ClientConfig::sdk_retry_config`]; the error returned
    /// here is the one left after the last attempt.
    pub fn call(&self, operation: &str, payload: Value) -> Result<Value, ApiError> {
        let request = ApiRequest {
            service: self.service.clone(),
            region: self.region.clone(),
            operation: operation.to_string(),
            payload,
        };

        let _permit = self.gate.acquire();
        let result = self.transport.send(&request);
        if let Err(err) = &result {
            tracing::debug!(
                "{}.{} failed in {}: {}",
                self.service,
                operation,
                self.region.as_deref().unwrap_or("default region"),
                err
            );
        }
        result
    }

    /// Call a paginated operation until `token_field` is absent or empty.
    ///
    /// The token returned in each page is copied into the next request under
    /// the same field name. Returns every page in order.
    pub fn paginate(
        &self,
        operation: &str,
        payload: Value,
        token_field: &str,
    ) -> Result<Vec<Value>, ApiError> {
        let mut payload = match payload {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };
        let mut pages = Vec::new();
        let mut previous_token: Option<String> = None;

        loop {
            let page = self.call(operation, payload.clone())?;
            let next = page
                .get(token_field)
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            pages.push(page);

            let Some(token) = next else { break };
            if previous_token.as_deref() == Some(token.as_str()) {
                tracing::warn!(
                    "{}.{} returned the same page token twice",
                    self.service,
                    operation
                );
                break;
            }
            match payload.as_object_mut() {
                Some(map) => {
                    map.insert(token_field.to_string(), Value::String(token.clone()));
                }
                None => break,
            }
            previous_token = Some(token);
        }

        Ok(pages)
    }
}

/// Build a client for `service_name` in the target's account and region.
///
/// Not cached: every call builds a fresh client from the defaults merged with
/// `overrides`.
pub fn get_client(
    target: &Target,
    service_name: &str,
    overrides: Option<&ClientConfigOverrides>,
) -> Result<Client, ConfigError> {
    client_for_session(target.session(), target.region(), service_name, overrides)
}

/// Like [`get_client`] without a target wrapper.
pub fn client_for_session(
    session: &Session,
    region: Option<&str>,
    service_name: &str,
    overrides: Option<&ClientConfigOverrides>,
) -> Result<Client, ConfigError> {
    let service = service_name.trim();
    if service.is_empty() {
        return Err(ConfigError::EmptyServiceName);
    }

    let config = match overrides {
        Some(overrides) => ClientConfig::default().merge(overrides),
        None => ClientConfig::default(),
    };
    config.validate()?;

    let transport = session.connector().connect(service, region, &config)?;

    Ok(Client {
        service: service.to_string(),
        region: region.map(str::to_string),
        gate: Arc::new(ConnectionGate::new(config.max_pool_connections)),
        config,
        transport,
    })
}
