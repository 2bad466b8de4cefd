//! Targets, per-task outcomes and the aggregate collection result.

use crate::aws::session::Session;
use crate::parallel::errors::{
    classify, error_code, format_error_summary, ErrorCategory, ErrorDetail,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// One unit of collection work: a session, a display identifier and an
/// optional region.
#[derive(Clone)]
pub struct Target {
    session: Session,
    identifier: String,
    account_name: Option<String>,
    region: Option<String>,
}

impl Target {
    pub fn new(session: Session, identifier: impl Into<String>, region: Option<&str>) -> Self {
        Self {
            session,
            identifier: identifier.into(),
            account_name: None,
            region: region.map(str::to_string),
        }
    }

    #[must_use]
    pub fn with_account_name(mut self, name: impl Into<String>) -> Self {
        self.account_name = Some(name.into());
        self
    }

    /// One target per session and region, sessions outermost.
    ///
    /// With no regions, one region-less target per session.
    pub fn cross_product(sessions: &[Session], regions: &[String]) -> Vec<Target> {
        sessions
            .iter()
            .flat_map(|session| {
                let identifier = session.profile_name().to_string();
                if regions.is_empty() {
                    vec![Target::new(session.clone(), identifier, None)]
                } else {
                    regions
                        .iter()
                        .map(|region| {
                            Target::new(session.clone(), identifier.clone(), Some(region))
                        })
                        .collect()
                }
            })
            .collect()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Display name; falls back to the identifier.
    pub fn account_name(&self) -> &str {
        self.account_name.as_deref().unwrap_or(&self.identifier)
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// `identifier/region`, or just the identifier.
    pub fn label(&self) -> String {
        match &self.region {
            Some(region) => format!("{}/{}", self.identifier, region),
            None => self.identifier.clone(),
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("identifier", &self.identifier)
            .field("account_name", &self.account_name)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

/// Why a task produced no value.
#[derive(Debug, Clone, Serialize)]
pub struct TaskError {
    pub identifier: String,
    pub region: Option<String>,
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Always 0: the engine does not retry.
    pub retries: u32,
}

impl TaskError {
    pub fn new(
        target: &Target,
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            identifier: target.identifier().to_string(),
            region: target.region().map(str::to_string),
            category,
            code: code.into(),
            message: message.into(),
            timestamp: Utc::now(),
            retries: 0,
        }
    }

    pub fn from_error(target: &Target, error: &anyhow::Error) -> Self {
        Self::new(target, classify(error), error_code(error), format!("{:#}", error))
    }

    pub fn cancelled(target: &Target) -> Self {
        Self::new(
            target,
            ErrorCategory::Unknown,
            "Cancelled",
            "run cancelled before this target started",
        )
    }

    pub fn rate_limited(target: &Target) -> Self {
        Self::new(
            target,
            ErrorCategory::Throttling,
            "RateLimitTimeout",
            "timed out waiting for a rate limiter token",
        )
    }

    pub fn location(&self) -> String {
        match &self.region {
            Some(region) => format!("{}/{}", self.identifier, region),
            None => self.identifier.clone(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}: {}", self.location(), self.category, self.code, self.message)
    }
}

/// Outcome of one target.
#[derive(Debug, Clone)]
pub struct TaskResult<R> {
    pub identifier: String,
    pub region: Option<String>,
    pub outcome: Result<R, TaskError>,
    pub duration: Duration,
}

impl<R> TaskResult<R> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&R> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.outcome.as_ref().err()
    }
}

/// Ordered outcomes of a run: entry `i` belongs to target `i`.
#[derive(Debug, Clone)]
pub struct CollectionResult<R> {
    results: Vec<TaskResult<R>>,
    total_duration: Duration,
}

impl<R> CollectionResult<R> {
    pub(crate) fn new(results: Vec<TaskResult<R>>, total_duration: Duration) -> Self {
        Self {
            results,
            total_duration,
        }
    }

    /// Success value or `None`, one per target.
    pub fn outcomes(&self) -> Vec<Option<&R>> {
        self.results.iter().map(TaskResult::value).collect()
    }

    pub fn get(&self, index: usize) -> Option<&TaskResult<R>> {
        self.results.get(index)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn results(&self) -> &[TaskResult<R>] {
        &self.results
    }

    pub fn successful(&self) -> Vec<&TaskResult<R>> {
        self.results.iter().filter(|r| r.is_success()).collect()
    }

    pub fn failed(&self) -> Vec<&TaskResult<R>> {
        self.results.iter().filter(|r| !r.is_success()).collect()
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn error_count(&self) -> usize {
        self.results.len() - self.success_count()
    }

    pub fn total_count(&self) -> usize {
        self.results.len()
    }

    pub fn has_any_success(&self) -> bool {
        self.results.iter().any(TaskResult::is_success)
    }

    pub fn has_any_failure(&self) -> bool {
        self.results.iter().any(|r| !r.is_success())
    }

    /// True when there was at least one target and every one failed.
    pub fn has_failures_only(&self) -> bool {
        !self.results.is_empty() && !self.has_any_success()
    }

    /// Wall-clock duration of the whole run.
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// Successful values in target order.
    pub fn data(&self) -> Vec<&R> {
        self.results.iter().filter_map(TaskResult::value).collect()
    }

    pub fn into_data(self) -> Vec<R> {
        self.results.into_iter().filter_map(|r| r.outcome.ok()).collect()
    }

    /// Successful values flattened, for collections of items per target.
    pub fn flat_data(&self) -> Vec<R::Item>
    where
        R: IntoIterator + Clone,
    {
        self.results
            .iter()
            .filter_map(TaskResult::value)
            .cloned()
            .flatten()
            .collect()
    }

    pub fn errors(&self) -> Vec<&TaskError> {
        self.results.iter().filter_map(TaskResult::error).collect()
    }

    pub fn errors_by_category(&self) -> BTreeMap<ErrorCategory, Vec<&TaskError>> {
        let mut grouped: BTreeMap<ErrorCategory, Vec<&TaskError>> = BTreeMap::new();
        for error in self.errors() {
            grouped.entry(error.category).or_default().push(error);
        }
        grouped
    }

    pub fn error_summary(&self) -> BTreeMap<ErrorCategory, usize> {
        let mut counts = BTreeMap::new();
        for error in self.errors() {
            *counts.entry(error.category).or_insert(0) += 1;
        }
        counts
    }

    /// Text summary, at most five detail lines per category.
    pub fn error_summary_text(&self) -> String {
        let details = self
            .errors()
            .into_iter()
            .map(|e| ErrorDetail {
                category: e.category,
                location: e.location(),
                message: format!("{}: {}", e.code, e.message),
            })
            .collect();
        format_error_summary(details)
    }
}
