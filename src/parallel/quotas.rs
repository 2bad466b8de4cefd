//! Service quota lookups with a per-checker TTL cache.
//!
//! [`ServiceQuotaChecker`] reads limits from the Service Quotas API and,
//! when a usage metric is known, current usage from CloudWatch. Lookup
//! failures are never raised: listing falls back to the AWS default quotas,
//! and single-quota lookups return `None`.
//!
//! # Usage
//!
//! ```no_run
//! use aws_audit_tools::parallel::quotas::{ServiceQuotaChecker, DEFAULT_CACHE_TTL};
//! use aws_audit_tools::aws::session::Session;
//! # fn demo(session: Session) {
//! let checker = ServiceQuotaChecker::new(session, "us-east-1", DEFAULT_CACHE_TTL);
//! let health = checker.check_quotas_health("ec2", 80.0);
//! for quota in &health.at_risk {
//!     println!("{}: {:.1}%", quota.quota_name(), quota.usage_percent().unwrap_or(0.0));
//! }
//! # }
//! ```

use crate::aws::api::ApiError;
use crate::aws::sdk::{METRICS_SERVICE, QUOTAS_SERVICE};
use crate::aws::session::Session;
use crate::parallel::client::{client_for_session, Client, ClientConfigOverrides};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_WARNING_THRESHOLD: f64 = 80.0;
/// Registry size at which every cached checker is dropped.
pub const MAX_CACHED_CHECKERS: usize = 50;

const USAGE_WINDOW_SECS: i64 = 3600;
const USAGE_PERIOD_SECS: u64 = 300;

/// Well-known quota codes per service.
pub const COMMON_QUOTAS: &[(&str, &[(&str, &str)])] = &[
    (
        "ec2",
        &[
            ("L-1216C47A", "Running On-Demand Standard instances"),
            ("L-34B43A08", "All Standard Spot Instance Requests"),
            ("L-0263D0A3", "EC2-VPC Elastic IPs"),
            ("L-E3A00192", "Volumes (io1, io2)"),
        ],
    ),
    (
        "lambda",
        &[
            ("L-B99A9384", "Concurrent executions"),
            ("L-2ACBD22F", "Function and layer storage"),
        ],
    ),
    (
        "rds",
        &[
            ("L-7B6409FD", "DB instances"),
            ("L-952B80B8", "DB clusters"),
            ("L-7ADDB58A", "DB cluster parameter groups"),
        ],
    ),
    ("s3", &[("L-DC2B2D3D", "Buckets")]),
    (
        "dynamodb",
        &[
            ("L-F98FE922", "Table-level read throughput"),
            ("L-F1E6EC6C", "Table-level write throughput"),
        ],
    ),
    (
        "iam",
        &[
            ("L-F4A5425F", "Roles"),
            ("L-FE177D64", "Users"),
            ("L-BF35879D", "Groups"),
        ],
    ),
];

/// `(quota_code, name)` pairs for a service; empty if none are listed.
pub fn common_quotas(service_code: &str) -> &'static [(&'static str, &'static str)] {
    COMMON_QUOTAS
        .iter()
        .find(|(service, _)| *service == service_code)
        .map(|(_, quotas)| *quotas)
        .unwrap_or(&[])
}

/// Usage level of a quota. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaStatus {
    Unknown,
    Ok,
    /// At least 80% used.
    Warning,
    /// At least 90% used.
    Critical,
    /// At least 100% used.
    Exceeded,
}

impl QuotaStatus {
    pub fn from_percent(percent: f64) -> Self {
        if percent >= 100.0 {
            QuotaStatus::Exceeded
        } else if percent >= 90.0 {
            QuotaStatus::Critical
        } else if percent >= 80.0 {
            QuotaStatus::Warning
        } else {
            QuotaStatus::Ok
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaStatus::Unknown => "unknown",
            QuotaStatus::Ok => "ok",
            QuotaStatus::Warning => "warning",
            QuotaStatus::Critical => "critical",
            QuotaStatus::Exceeded => "exceeded",
        }
    }
}

impl fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CloudWatch metric that reports usage for a quota.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageMetric {
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: Vec<(String, String)>,
}

impl UsageMetric {
    pub fn new(namespace: impl Into<String>, metric_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            metric_name: metric_name.into(),
            dimensions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.push((name.into(), value.into()));
        self
    }

    /// Parse the `UsageMetric` block of a Service Quotas `Quota` object.
    pub fn from_api(quota: &Value) -> Option<Self> {
        let usage = quota.get("UsageMetric")?;
        let namespace = usage.get("MetricNamespace")?.as_str()?;
        let metric_name = usage.get("MetricName")?.as_str()?;
        let mut dimensions: Vec<(String, String)> = usage
            .get("MetricDimensions")
            .and_then(Value::as_object)
            .map(|dims| {
                dims.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        dimensions.sort();
        Some(Self {
            namespace: namespace.to_string(),
            metric_name: metric_name.to_string(),
            dimensions,
        })
    }
}

/// One service quota.
///
/// `usage_percent` and `status` are derived from `usage_value / value` and
/// recomputed whenever either changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaInfo {
    service_code: String,
    quota_code: String,
    quota_name: String,
    value: f64,
    unit: String,
    adjustable: bool,
    global_quota: bool,
    usage_value: Option<f64>,
    usage_percent: Option<f64>,
    status: QuotaStatus,
    #[serde(skip)]
    usage_metric: Option<UsageMetric>,
}

impl QuotaInfo {
    pub fn new(
        service_code: impl Into<String>,
        quota_code: impl Into<String>,
        quota_name: impl Into<String>,
        value: f64,
    ) -> Self {
        let mut info = Self {
            service_code: service_code.into(),
            quota_code: quota_code.into(),
            quota_name: quota_name.into(),
            value,
            unit: "None".to_string(),
            adjustable: false,
            global_quota: false,
            usage_value: None,
            usage_percent: None,
            status: QuotaStatus::Unknown,
            usage_metric: None,
        };
        info.recompute();
        info
    }

    /// Build from a Service Quotas `Quota` object.
    pub fn from_api(service_code: &str, quota: &Value) -> Self {
        let text = |field: &str| quota.get(field).and_then(Value::as_str).unwrap_or("");
        let flag = |field: &str| quota.get(field).and_then(Value::as_bool).unwrap_or(false);

        let mut info = Self::new(
            service_code,
            text("QuotaCode"),
            text("QuotaName"),
            quota.get("Value").and_then(Value::as_f64).unwrap_or(0.0),
        );
        if let Some(unit) = quota.get("Unit").and_then(Value::as_str) {
            info.unit = unit.to_string();
        }
        info.adjustable = flag("Adjustable");
        info.global_quota = flag("GlobalQuota");
        info.usage_metric = UsageMetric::from_api(quota);
        info
    }

    #[must_use]
    pub fn with_usage(mut self, usage: Option<f64>) -> Self {
        self.set_usage(usage);
        self
    }

    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    #[must_use]
    pub fn with_flags(mut self, adjustable: bool, global_quota: bool) -> Self {
        self.adjustable = adjustable;
        self.global_quota = global_quota;
        self
    }

    #[must_use]
    pub fn with_usage_metric(mut self, metric: UsageMetric) -> Self {
        self.usage_metric = Some(metric);
        self
    }

    pub fn set_usage(&mut self, usage: Option<f64>) {
        self.usage_value = usage;
        self.recompute();
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
        self.recompute();
    }

    fn recompute(&mut self) {
        self.usage_percent = match self.usage_value {
            Some(usage) if self.value > 0.0 => Some(usage / self.value * 100.0),
            _ => None,
        };
        self.status = self
            .usage_percent
            .map_or(QuotaStatus::Unknown, QuotaStatus::from_percent);
    }

    pub fn service_code(&self) -> &str {
        &self.service_code
    }

    pub fn quota_code(&self) -> &str {
        &self.quota_code
    }

    pub fn quota_name(&self) -> &str {
        &self.quota_name
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn adjustable(&self) -> bool {
        self.adjustable
    }

    pub fn global_quota(&self) -> bool {
        self.global_quota
    }

    pub fn usage_value(&self) -> Option<f64> {
        self.usage_value
    }

    /// `None` when usage is unknown or the limit is not positive.
    pub fn usage_percent(&self) -> Option<f64> {
        self.usage_percent
    }

    pub fn status(&self) -> QuotaStatus {
        self.status
    }

    pub fn usage_metric(&self) -> Option<&UsageMetric> {
        self.usage_metric.as_ref()
    }
}

/// Three-way split of quotas by usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuotaHealth {
    pub ok: Vec<QuotaInfo>,
    pub at_risk: Vec<QuotaInfo>,
    pub unknown: Vec<QuotaInfo>,
}

impl QuotaHealth {
    pub fn total(&self) -> usize {
        self.ok.len() + self.at_risk.len() + self.unknown.len()
    }
}

/// Partition quotas: no usage percentage → `unknown`, at or above
/// `threshold` → `at_risk`, otherwise `ok`. Input order is kept.
pub fn partition_health(quotas: &[QuotaInfo], threshold: f64) -> QuotaHealth {
    let mut health = QuotaHealth::default();
    for quota in quotas {
        match quota.usage_percent() {
            None => health.unknown.push(quota.clone()),
            Some(percent) if percent >= threshold => health.at_risk.push(quota.clone()),
            Some(_) => health.ok.push(quota.clone()),
        }
    }
    health
}

#[derive(Debug, Clone)]
pub enum CachedValue {
    Quotas(Vec<QuotaInfo>),
    Quota(QuotaInfo),
}

/// A cached value with its insertion time.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: CachedValue,
    inserted: Instant,
    ttl: Duration,
}

impl CacheEntry {
    pub fn new(data: CachedValue, inserted: Instant, ttl: Duration) -> Self {
        Self { data, inserted, ttl }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Expired once `ttl` or more has elapsed since insertion.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted) >= self.ttl
    }
}

/// TTL cache guarded by a single mutex.
#[derive(Debug)]
pub struct QuotaCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl QuotaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<CachedValue> {
        self.get_at(key, Instant::now())
    }

    /// Lookup as of `now`; expired entries are evicted.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<CachedValue> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => Some(entry.data.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, data: CachedValue) {
        self.insert_at(key, data, Instant::now());
    }

    pub fn insert_at(&self, key: impl Into<String>, data: CachedValue, now: Instant) {
        self.lock()
            .insert(key.into(), CacheEntry::new(data, now, self.ttl));
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Quota lookups for one session and region.
pub struct ServiceQuotaChecker {
    session: Session,
    region: String,
    overrides: Option<ClientConfigOverrides>,
    cache: QuotaCache,
}

impl fmt::Debug for ServiceQuotaChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceQuotaChecker")
            .field("profile", &self.session.profile_name())
            .field("region", &self.region)
            .field("cache_ttl", &self.cache.ttl())
            .finish_non_exhaustive()
    }
}

impl ServiceQuotaChecker {
    pub fn new(session: Session, region: impl Into<String>, cache_ttl: Duration) -> Self {
        Self::with_cache(session, region, QuotaCache::new(cache_ttl))
    }

    pub fn with_cache(session: Session, region: impl Into<String>, cache: QuotaCache) -> Self {
        Self {
            session,
            region: region.into(),
            overrides: None,
            cache,
        }
    }

    /// Client settings for the underlying API clients.
    #[must_use]
    pub fn with_client_overrides(mut self, overrides: ClientConfigOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn cache(&self) -> &QuotaCache {
        &self.cache
    }

    fn client(&self, service: &str) -> Result<Client, ApiError> {
        client_for_session(&self.session, Some(&self.region), service, self.overrides.as_ref())
            .map_err(|e| ApiError::new("ConfigError", e.to_string()))
    }

    fn list_quotas(&self, operation: &str, service_code: &str) -> Result<Vec<QuotaInfo>, ApiError> {
        let client = self.client(QUOTAS_SERVICE)?;
        let pages = client.paginate(
            operation,
            json!({ "ServiceCode": service_code, "MaxResults": 100 }),
            "NextToken",
        )?;

        Ok(pages
            .iter()
            .filter_map(|page| page.get("Quotas").and_then(Value::as_array))
            .flatten()
            .map(|quota| QuotaInfo::from_api(service_code, quota))
            .collect())
    }

    /// Every quota of a service.
    ///
    /// Falls back to the AWS default quotas when the applied-quota listing
    /// fails. Successful listings are cached; if both fail, an empty list is
    /// returned and nothing is cached.
    pub fn get_service_quotas(&self, service_code: &str) -> Vec<QuotaInfo> {
        let key = format!("quotas:{}:{}", service_code, self.region);
        if let Some(CachedValue::Quotas(quotas)) = self.cache.get(&key) {
            return quotas;
        }

        let quotas = match self.list_quotas("ListServiceQuotas", service_code) {
            Ok(quotas) => quotas,
            Err(err) => {
                tracing::debug!(
                    "ListServiceQuotas failed for {} in {}: {}; trying defaults",
                    service_code,
                    self.region,
                    err
                );
                match self.list_quotas("ListAWSDefaultServiceQuotas", service_code) {
                    Ok(quotas) => quotas,
                    Err(err) => {
                        tracing::debug!(
                            "ListAWSDefaultServiceQuotas failed for {} in {}: {}",
                            service_code,
                            self.region,
                            err
                        );
                        return Vec::new();
                    }
                }
            }
        };

        self.cache.insert(key, CachedValue::Quotas(quotas.clone()));
        quotas
    }

    /// Find a quota by name: exact (case-insensitive) first, then the first
    /// substring match.
    pub fn get_quota(&self, service_code: &str, quota_name: &str) -> Option<QuotaInfo> {
        find_quota(&self.get_service_quotas(service_code), quota_name)
    }

    /// One quota with current usage, if a metric is given.
    ///
    /// Usage is the largest `Maximum` datapoint over the last hour at a
    /// five-minute period. Any failure yields `None`, and only complete
    /// lookups are cached: a failed usage query is retried on the next call.
    pub fn get_quota_with_usage(
        &self,
        service_code: &str,
        quota_code: &str,
        metric: Option<&UsageMetric>,
    ) -> Option<QuotaInfo> {
        let key = format!("quota_usage:{}:{}:{}", service_code, quota_code, self.region);
        if let Some(CachedValue::Quota(quota)) = self.cache.get(&key) {
            return Some(quota);
        }

        let response = self
            .client(QUOTAS_SERVICE)
            .and_then(|client| {
                client.call(
                    "GetServiceQuota",
                    json!({ "ServiceCode": service_code, "QuotaCode": quota_code }),
                )
            })
            .map_err(|err| {
                tracing::debug!(
                    "GetServiceQuota failed for {}/{} in {}: {}",
                    service_code,
                    quota_code,
                    self.region,
                    err
                );
            })
            .ok()?;

        let raw = response.get("Quota")?;
        let mut quota = QuotaInfo::from_api(service_code, raw);
        if quota.quota_code.is_empty() {
            quota.quota_code = quota_code.to_string();
        }

        let metric = metric.cloned().or_else(|| quota.usage_metric.clone());
        if let Some(metric) = &metric {
            match self.metric_maximum(metric) {
                Ok(usage) => quota.set_usage(usage),
                Err(err) => {
                    tracing::debug!(
                        "GetMetricStatistics failed for {}/{} in {}: {}",
                        metric.namespace,
                        metric.metric_name,
                        self.region,
                        err
                    );
                    return None;
                }
            }
        }

        self.cache.insert(key, CachedValue::Quota(quota.clone()));
        Some(quota)
    }

    /// Largest `Maximum` datapoint, `Ok(None)` when the metric has no data.
    fn metric_maximum(&self, metric: &UsageMetric) -> Result<Option<f64>, ApiError> {
        let end = Utc::now().timestamp();
        let dimensions: Vec<Value> = metric
            .dimensions
            .iter()
            .map(|(name, value)| json!({ "Name": name, "Value": value }))
            .collect();
        let mut payload = json!({
            "Namespace": metric.namespace,
            "MetricName": metric.metric_name,
            "StartTime": end - USAGE_WINDOW_SECS,
            "EndTime": end,
            "Period": USAGE_PERIOD_SECS,
            "Statistics": ["Maximum"],
        });
        if !dimensions.is_empty() {
            payload["Dimensions"] = Value::Array(dimensions);
        }

        let response = self
            .client(METRICS_SERVICE)?
            .call("GetMetricStatistics", payload)?;

        Ok(response
            .get("Datapoints")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|point| point.get("Maximum").and_then(Value::as_f64))
            .fold(None, |max: Option<f64>, v| Some(max.map_or(v, |m| m.max(v)))))
    }

    /// Fill in usage for every quota that carries a usage metric.
    ///
    /// Quotas without a metric, or whose lookup fails, are returned unchanged.
    pub fn attach_usage(&self, quotas: &[QuotaInfo]) -> Vec<QuotaInfo> {
        quotas
            .iter()
            .map(|quota| match quota.usage_metric() {
                Some(metric) => self
                    .get_quota_with_usage(quota.service_code(), quota.quota_code(), Some(metric))
                    .unwrap_or_else(|| quota.clone()),
                None => quota.clone(),
            })
            .collect()
    }

    /// Partition the service's quotas by usage.
    ///
    /// Listings carry no usage, so this only reports quotas as `ok` or
    /// `at_risk` when usage was attached elsewhere; see
    /// [`attach_usage`](Self::attach_usage).
    pub fn check_quotas_health(&self, service_code: &str, threshold: f64) -> QuotaHealth {
        partition_health(&self.get_service_quotas(service_code), threshold)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// Exact case-insensitive name match, else first substring match.
pub fn find_quota(quotas: &[QuotaInfo], quota_name: &str) -> Option<QuotaInfo> {
    let wanted = quota_name.to_lowercase();
    if let Some(exact) = quotas.iter().find(|q| q.quota_name.to_lowercase() == wanted) {
        return Some(exact.clone());
    }

    let partial: Vec<&QuotaInfo> = quotas
        .iter()
        .filter(|q| q.quota_name.to_lowercase().contains(&wanted))
        .collect();
    if partial.len() > 1 {
        let names: Vec<&str> = partial.iter().map(|q| q.quota_name()).collect();
        tracing::warn!(
            "quota name '{}' is ambiguous, using '{}' (candidates: {})",
            quota_name,
            names[0],
            names.join(", ")
        );
    }
    partial.first().map(|q| (*q).clone())
}

/// Checkers reused per (profile, region).
#[derive(Debug)]
pub struct QuotaCheckerRegistry {
    cache_ttl: Duration,
    checkers: Mutex<HashMap<String, Arc<ServiceQuotaChecker>>>,
}

impl Default for QuotaCheckerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl QuotaCheckerRegistry {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            cache_ttl,
            checkers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ServiceQuotaChecker>>> {
        self.checkers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared checker for the session's profile and `region`.
    ///
    /// When the registry is full it is emptied before the new checker is added.
    pub fn get(&self, session: &Session, region: &str) -> Arc<ServiceQuotaChecker> {
        let key = format!("{}:{}", session.profile_name(), region);
        let mut checkers = self.lock();
        if let Some(checker) = checkers.get(&key) {
            return Arc::clone(checker);
        }
        if checkers.len() >= MAX_CACHED_CHECKERS {
            checkers.clear();
        }
        let checker = Arc::new(ServiceQuotaChecker::new(session.clone(), region, self.cache_ttl));
        checkers.insert(key, Arc::clone(&checker));
        checker
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }
}
