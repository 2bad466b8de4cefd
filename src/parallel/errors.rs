//! Error classification and collection for parallel runs.
//!
//! Every per-target failure is classified into an [`ErrorCategory`] so a run
//! across hundreds of account/region pairs can be summarised as
//! "12 access denied, 3 throttled" instead of a wall of stack traces.
//!
//! Classification prefers structured error codes ([`ApiError::code`]) and
//! falls back to keyword matching on the rendered message. It never panics
//! and never fails: anything unrecognised is [`ErrorCategory::Unknown`].
//!
//! # Usage
//!
//! ```
//! use aws_audit_tools::parallel::errors::{ErrorCategory, ErrorCollector};
//! use aws_audit_tools::aws::api::ApiError;
//!
//! let collector = ErrorCollector::new("ec2");
//! let err = anyhow::Error::new(ApiError::new("AccessDenied", "not allowed"));
//! collector.record("prod-account", Some("us-east-1"), &err);
//!
//! assert_eq!(collector.summary()[&ErrorCategory::AccessDenied], 1);
//! ```

use crate::aws::api::ApiError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Detail lines shown per category in text summaries.
pub const MAX_DETAIL_LINES: usize = 5;

/// Coarse classification of a per-target failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ErrorCategory {
    Throttling,
    AccessDenied,
    NotFound,
    /// Network errors, timeouts, service unavailable, internal errors.
    Transient,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 5] = [
        ErrorCategory::Throttling,
        ErrorCategory::AccessDenied,
        ErrorCategory::NotFound,
        ErrorCategory::Transient,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Throttling => "Throttling",
            ErrorCategory::AccessDenied => "AccessDenied",
            ErrorCategory::NotFound => "NotFound",
            ErrorCategory::Transient => "Transient",
            ErrorCategory::Unknown => "Unknown",
        }
    }

    /// Whether a client-level retry can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Throttling | ErrorCategory::Transient)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "LimitExceededException",
    "BandwidthLimitExceeded",
    "ProvisionedThroughputExceededException",
    "PriorRequestNotComplete",
    "EC2ThrottledException",
    "SlowDown",
    "RateLimitTimeout",
];

const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "UnauthorizedOperation",
    "UnauthorizedAccess",
    "AuthFailure",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "ExpiredTokenException",
    "OptInRequired",
];

const NOT_FOUND_CODES: &[&str] = &[
    "NotFound",
    "NotFoundException",
    "ResourceNotFoundException",
    "NoSuchEntity",
    "NoSuchBucket",
    "NoSuchKey",
];

const TRANSIENT_CODES: &[&str] = &[
    "RequestTimeout",
    "RequestTimeoutException",
    "InternalError",
    "InternalFailure",
    "InternalServerError",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "ConnectionError",
    "NetworkError",
    "IDPCommunicationError",
];

/// Classify a provider error code.
///
/// Exact codes are matched first, then case-insensitive keywords. Codes that
/// match neither are `Unknown`.
pub fn classify_code(code: &str) -> ErrorCategory {
    let tables = [
        (THROTTLING_CODES, ErrorCategory::Throttling),
        (ACCESS_DENIED_CODES, ErrorCategory::AccessDenied),
        (NOT_FOUND_CODES, ErrorCategory::NotFound),
        (TRANSIENT_CODES, ErrorCategory::Transient),
    ];
    for (codes, category) in tables {
        if codes.contains(&code) {
            return category;
        }
    }
    classify_keywords(code)
}

fn classify_keywords(text: &str) -> ErrorCategory {
    let normalized: String = text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    let has = |keywords: &[&str]| keywords.iter().any(|k| normalized.contains(k));

    if has(&["accessdenied", "unauthorized", "forbidden", "authfailure"]) {
        ErrorCategory::AccessDenied
    } else if has(&["notfound", "nosuch", "doesnotexist"]) {
        ErrorCategory::NotFound
    } else if has(&["throttl", "ratelimit", "toomanyrequests", "slowdown"]) {
        ErrorCategory::Throttling
    } else if has(&[
        "timeout",
        "timedout",
        "internalerror",
        "internalfailure",
        "serviceunavailable",
        "serviceerror",
        "connection",
        "network",
    ]) {
        ErrorCategory::Transient
    } else {
        ErrorCategory::Unknown
    }
}

/// Classify an error by walking its cause chain.
///
/// A structured [`ApiError`] anywhere in the chain wins. Transport-level
/// `reqwest` and `std::io` errors are transient. Otherwise the rendered
/// message is matched by keyword.
pub fn classify(error: &anyhow::Error) -> ErrorCategory {
    for cause in error.chain() {
        if let Some(api) = cause.downcast_ref::<ApiError>() {
            return api.category();
        }
        if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
            if let Some(status) = http.status() {
                return ApiError::new("", "").with_status(status.as_u16()).category();
            }
            return ErrorCategory::Transient;
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return ErrorCategory::Transient;
        }
    }
    classify_keywords(&format!("{:#}", error))
}

/// Structured error code for an error, or a stable fallback name.
pub fn error_code(error: &anyhow::Error) -> String {
    for cause in error.chain() {
        if let Some(api) = cause.downcast_ref::<ApiError>() {
            return api.code.clone();
        }
        if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
            let code = if http.is_timeout() {
                "RequestTimeout"
            } else if http.is_connect() {
                "ConnectionError"
            } else {
                "NetworkError"
            };
            return code.to_string();
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return "IoError".to_string();
        }
    }
    match classify(error) {
        ErrorCategory::Unknown => "Error".to_string(),
        category => category.as_str().to_string(),
    }
}

/// How loudly a collected error should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ErrorSeverity {
    Critical,
    Warning,
    Info,
    Debug,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Critical => "critical",
            ErrorSeverity::Warning => "warning",
            ErrorSeverity::Info => "info",
            ErrorSeverity::Debug => "debug",
        }
    }
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize)]
pub struct CollectedError {
    pub timestamp: DateTime<Utc>,
    pub identifier: String,
    pub region: Option<String>,
    pub service: String,
    pub operation: String,
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
}

impl CollectedError {
    fn location(&self) -> String {
        match &self.region {
            Some(region) => format!("{}/{}", self.identifier, region),
            None => self.identifier.clone(),
        }
    }
}

impl fmt::Display for CollectedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} - {}",
            self.severity.as_str().to_uppercase(),
            self.location(),
            self.service
        )?;
        if !self.operation.is_empty() {
            write!(f, ".{}", self.operation)?;
        }
        write!(f, ": {}", self.code)
    }
}

/// Thread-safe, append-only log of classified failures.
#[derive(Debug)]
pub struct ErrorCollector {
    service: String,
    errors: Mutex<Vec<CollectedError>>,
}

impl ErrorCollector {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Classify and append an error at `Warning` severity.
    pub fn record(
        &self,
        identifier: &str,
        region: Option<&str>,
        error: &anyhow::Error,
    ) -> ErrorCategory {
        self.record_operation(identifier, region, "", error, ErrorSeverity::Warning)
    }

    /// Classify and append an error for a named operation.
    ///
    /// Access-denied errors are downgraded to `Info`: a missing permission in
    /// one account is expected in a multi-account survey.
    pub fn record_operation(
        &self,
        identifier: &str,
        region: Option<&str>,
        operation: &str,
        error: &anyhow::Error,
        severity: ErrorSeverity,
    ) -> ErrorCategory {
        let category = classify(error);
        let severity = if category == ErrorCategory::AccessDenied {
            ErrorSeverity::Info
        } else {
            severity
        };

        let collected = CollectedError {
            timestamp: Utc::now(),
            identifier: identifier.to_string(),
            region: region.map(str::to_string),
            service: self.service.clone(),
            operation: operation.to_string(),
            code: error_code(error),
            message: format!("{:#}", error),
            category,
            severity,
        };

        match severity {
            ErrorSeverity::Critical => tracing::error!("{}", collected),
            ErrorSeverity::Warning => tracing::warn!("{}", collected),
            ErrorSeverity::Info => tracing::info!("{}", collected),
            ErrorSeverity::Debug => tracing::debug!("{}", collected),
        }

        self.lock().push(collected);
        category
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CollectedError>> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every recorded error in insertion order.
    pub fn errors(&self) -> Vec<CollectedError> {
        self.lock().clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn critical_errors(&self) -> Vec<CollectedError> {
        self.with_severity(ErrorSeverity::Critical)
    }

    pub fn warning_errors(&self) -> Vec<CollectedError> {
        self.with_severity(ErrorSeverity::Warning)
    }

    fn with_severity(&self, severity: ErrorSeverity) -> Vec<CollectedError> {
        self.lock()
            .iter()
            .filter(|e| e.severity == severity)
            .cloned()
            .collect()
    }

    /// Count of errors per category.
    pub fn summary(&self) -> BTreeMap<ErrorCategory, usize> {
        let mut counts = BTreeMap::new();
        for error in self.lock().iter() {
            *counts.entry(error.category).or_insert(0) += 1;
        }
        counts
    }

    /// Errors grouped by identifier.
    pub fn by_account(&self) -> BTreeMap<String, Vec<CollectedError>> {
        let mut grouped: BTreeMap<String, Vec<CollectedError>> = BTreeMap::new();
        for error in self.lock().iter() {
            grouped
                .entry(error.identifier.clone())
                .or_default()
                .push(error.clone());
        }
        grouped
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Human-readable summary with bounded detail per category.
    pub fn to_text(&self) -> String {
        let details: Vec<ErrorDetail> = self
            .lock()
            .iter()
            .map(|e| ErrorDetail {
                category: e.category,
                location: e.location(),
                message: e.message.clone(),
            })
            .collect();
        format_error_summary(details)
    }
}

/// One line of detail in a rendered error summary.
pub(crate) struct ErrorDetail {
    pub category: ErrorCategory,
    pub location: String,
    pub message: String,
}

/// Render per-category counts followed by at most [`MAX_DETAIL_LINES`]
/// detail lines each, sorted by location.
pub(crate) fn format_error_summary(mut details: Vec<ErrorDetail>) -> String {
    if details.is_empty() {
        return "No errors".to_string();
    }

    details.sort_by(|a, b| a.category.cmp(&b.category).then_with(|| a.location.cmp(&b.location)));

    let mut out = format!("{} error(s)\n", details.len());
    for category in ErrorCategory::ALL {
        let in_category: Vec<&ErrorDetail> =
            details.iter().filter(|d| d.category == category).collect();
        if in_category.is_empty() {
            continue;
        }

        out.push_str(&format!("  {}: {}\n", category, in_category.len()));
        for detail in in_category.iter().take(MAX_DETAIL_LINES) {
            out.push_str(&format!("    - {}: {}\n", detail.location, first_line(&detail.message)));
        }
        if in_category.len() > MAX_DETAIL_LINES {
            out.push_str(&format!(
                "    ...and {} more\n",
                in_category.len() - MAX_DETAIL_LINES
            ));
        }
    }
    out
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("")
}

/// Run a side call; on failure record it and return `default`.
///
/// Meant for optional lookups (tags, descriptions) whose failure should not
/// fail the surrounding collection. Errors are recorded at `Debug` severity;
/// without a collector they are only logged.
pub fn try_or_default<T, F>(
    f: F,
    default: T,
    collector: Option<&ErrorCollector>,
    identifier: &str,
    region: Option<&str>,
    operation: &str,
) -> T
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match f() {
        Ok(value) => value,
        Err(err) => {
            match collector {
                Some(collector) => {
                    let severity = ErrorSeverity::Debug;
                    collector.record_operation(identifier, region, operation, &err, severity);
                }
                None => tracing::debug!(
                    "{}/{} {}: {:#}",
                    identifier,
                    region.unwrap_or("-"),
                    operation,
                    err
                ),
            }
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_classify_code_exact() {
        assert_eq!(classify_code("ThrottlingException"), ErrorCategory::Throttling);
        assert_eq!(classify_code("UnauthorizedOperation"), ErrorCategory::AccessDenied);
        assert_eq!(classify_code("NoSuchEntity"), ErrorCategory::NotFound);
        assert_eq!(classify_code("ServiceUnavailable"), ErrorCategory::Transient);
        assert_eq!(classify_code("RateLimitTimeout"), ErrorCategory::Throttling);
    }

    #[test]
    fn test_classify_code_keywords() {
        assert_eq!(classify_code("Client.AccessDeniedForRole"), ErrorCategory::AccessDenied);
        assert_eq!(classify_code("InvalidGroup.NotFound"), ErrorCategory::NotFound);
        assert_eq!(classify_code("CustomThrottled"), ErrorCategory::Throttling);
        assert_eq!(classify_code("GatewayTimeout"), ErrorCategory::Transient);
        assert_eq!(classify_code("ValidationException"), ErrorCategory::Unknown);
        assert_eq!(classify_code(""), ErrorCategory::Unknown);
    }

    #[test]
    fn test_classify_walks_chain() {
        let err = anyhow::Error::new(ApiError::new("AccessDenied", "nope"))
            .context("describe_instances failed");
        assert_eq!(classify(&err), ErrorCategory::AccessDenied);
        assert_eq!(error_code(&err), "AccessDenied");
    }

    #[test]
    fn test_classify_io_error() {
        let err = anyhow::Error::new(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(classify(&err), ErrorCategory::Transient);
        assert_eq!(error_code(&err), "IoError");
    }

    #[test]
    fn test_classify_message_fallback() {
        assert_eq!(classify(&anyhow!("request timed out")), ErrorCategory::Transient);
        assert_eq!(classify(&anyhow!("Access Denied for user")), ErrorCategory::AccessDenied);
        assert_eq!(classify(&anyhow!("something odd")), ErrorCategory::Unknown);
        assert_eq!(error_code(&anyhow!("something odd")), "Error");
    }

    #[test]
    fn test_access_denied_downgraded_to_info() {
        let collector = ErrorCollector::new("ec2");
        let err = anyhow::Error::new(ApiError::new("AccessDenied", "nope"));
        collector.record_operation("acct", None, "describe", &err, ErrorSeverity::Critical);

        let errors = collector.errors();
        assert_eq!(errors[0].severity, ErrorSeverity::Info);
        assert!(collector.critical_errors().is_empty());
    }

    #[test]
    fn test_concurrent_record() {
        let collector = Arc::new(ErrorCollector::new("ec2"));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for j in 0..25 {
                        let err = anyhow!("throttled request {}", j);
                        collector.record(&format!("acct-{}", i), Some("us-east-1"), &err);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(collector.len(), 200);
        assert_eq!(collector.summary()[&ErrorCategory::Throttling], 200);
        assert_eq!(collector.by_account().len(), 8);
    }

    #[test]
    fn test_to_text_caps_details() {
        let collector = ErrorCollector::new("ec2");
        for i in 0..8 {
            let err = anyhow::Error::new(ApiError::new("AccessDenied", format!("denied {}", i)));
            collector.record(&format!("acct-{}", i), None, &err);
        }

        let text = collector.to_text();
        assert!(text.starts_with("8 error(s)"));
        assert!(text.contains("AccessDenied: 8"));
        assert!(text.contains("acct-0"));
        assert!(text.contains("acct-4"));
        assert!(!text.contains("acct-5"));
        assert!(text.contains("...and 3 more"));
    }

    #[test]
    fn test_clear() {
        let collector = ErrorCollector::new("ec2");
        collector.record("acct", None, &anyhow!("x"));
        assert!(collector.has_errors());
        collector.clear();
        assert!(!collector.has_errors());
        assert_eq!(collector.to_text(), "No errors");
    }

    #[test]
    fn test_try_or_default() {
        let collector = ErrorCollector::new("ec2");
        let value = try_or_default(
            || Err(anyhow!("tags unavailable")),
            Vec::<String>::new(),
            Some(&collector),
            "acct",
            Some("eu-west-1"),
            "describe_tags",
        );
        assert!(value.is_empty());
        assert_eq!(collector.errors()[0].severity, ErrorSeverity::Debug);

        let value = try_or_default(|| Ok(7), 0, None, "acct", None, "count");
        assert_eq!(value, 7);
    }
}
