/// Integration tests for the service quota checker
/// Service Quotas and CloudWatch are simulated by routing transports
use aws_audit_tools::aws::api::{ApiError, ApiRequest};
use aws_audit_tools::aws::session::Session;
use aws_audit_tools::parallel::quotas::{
    partition_health, CachedValue, QuotaCache, DEFAULT_CACHE_TTL, DEFAULT_WARNING_THRESHOLD,
};
use aws_audit_tools::parallel::{QuotaInfo, QuotaStatus, ServiceQuotaChecker};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn quota(code: &str, name: &str, value: f64) -> Value {
    json!({
        "QuotaCode": code,
        "QuotaName": name,
        "Value": value,
        "Unit": "None",
        "Adjustable": true
    })
}

fn denied() -> ApiError {
    ApiError::new("AccessDeniedException", "not authorized").with_status(400)
}

/// Counts calls per operation and answers with `handler`.
fn routed_session<F>(calls: Arc<AtomicUsize>, handler: F) -> Session
where
    F: Fn(&ApiRequest) -> Result<Value, ApiError> + Send + Sync + 'static,
{
    Session::with_transport("audit", move |request: &ApiRequest| {
        calls.fetch_add(1, Ordering::SeqCst);
        handler(request)
    })
}

#[test]
fn test_fallback_to_default_quotas() {
    let calls = Arc::new(AtomicUsize::new(0));
    let session = routed_session(calls.clone(), |request| match request.operation.as_str() {
        "ListServiceQuotas" => Err(denied()),
        "ListAWSDefaultServiceQuotas" => Ok(json!({
            "Quotas": [quota("L-1216C47A", "Running On-Demand Standard instances", 1152.0)]
        })),
        other => Err(ApiError::new("UnknownOperation", other)),
    });
    let checker = ServiceQuotaChecker::new(session, "us-east-1", DEFAULT_CACHE_TTL);

    let quotas = checker.get_service_quotas("ec2");
    assert_eq!(quotas.len(), 1);
    assert_eq!(quotas[0].quota_code(), "L-1216C47A");
    assert_eq!(quotas[0].value(), 1152.0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // served from cache
    assert_eq!(checker.get_service_quotas("ec2"), quotas);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_failed_lookups_not_cached() {
    let calls = Arc::new(AtomicUsize::new(0));
    let session = routed_session(calls.clone(), |_| Err(denied()));
    let checker = ServiceQuotaChecker::new(session, "eu-west-1", DEFAULT_CACHE_TTL);

    assert!(checker.get_service_quotas("ec2").is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(checker.cache().is_empty());

    assert!(checker.get_service_quotas("ec2").is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_listing_paginates_and_finds_by_name() {
    let calls = Arc::new(AtomicUsize::new(0));
    let session = routed_session(calls, |request| {
        match request.payload.get("NextToken").and_then(Value::as_str) {
            None => Ok(json!({
                "Quotas": [quota("L-0263D0A3", "EC2-VPC Elastic IPs", 5.0)],
                "NextToken": "page-2"
            })),
            Some(_) => Ok(json!({
                "Quotas": [quota("L-1216C47A", "Running On-Demand Standard instances", 1152.0)]
            })),
        }
    });
    let checker = ServiceQuotaChecker::new(session, "us-east-1", DEFAULT_CACHE_TTL);

    assert_eq!(checker.get_service_quotas("ec2").len(), 2);
    let exact = checker.get_quota("ec2", "ec2-vpc elastic ips").unwrap();
    assert_eq!(exact.quota_code(), "L-0263D0A3");
    let partial = checker.get_quota("ec2", "On-Demand").unwrap();
    assert_eq!(partial.quota_code(), "L-1216C47A");
    assert!(checker.get_quota("ec2", "Dedicated Hosts").is_none());
}

fn quota_with_metric() -> Value {
    let mut raw = quota("L-1216C47A", "Running On-Demand Standard instances", 100.0);
    raw["UsageMetric"] = json!({
        "MetricNamespace": "AWS/Usage",
        "MetricName": "ResourceCount",
        "MetricDimensions": {
            "Service": "EC2",
            "Type": "Resource",
            "Resource": "vCPU",
            "Class": "Standard/OnDemand"
        }
    });
    raw
}

fn unknown_operation(request: &ApiRequest) -> ApiError {
    ApiError::new(
        "UnknownOperation",
        format!("{}.{}", request.service, request.operation),
    )
}

#[test]
fn test_quota_with_usage_from_cloudwatch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let session = routed_session(calls.clone(), |request| {
        match (request.service.as_str(), request.operation.as_str()) {
            ("service-quotas", "GetServiceQuota") => Ok(json!({ "Quota": quota_with_metric() })),
            ("cloudwatch", "GetMetricStatistics") => {
                assert_eq!(request.payload["Namespace"], "AWS/Usage");
                assert_eq!(request.payload["Statistics"], json!(["Maximum"]));
                Ok(json!({
                    "Datapoints": [{"Maximum": 45.0}, {"Maximum": 87.0}, {"Maximum": 60.0}]
                }))
            }
            _ => Err(unknown_operation(request)),
        }
    });
    let checker = ServiceQuotaChecker::new(session, "us-east-1", DEFAULT_CACHE_TTL);

    let info = checker.get_quota_with_usage("ec2", "L-1216C47A", None).unwrap();
    assert_eq!(info.usage_value(), Some(87.0));
    assert_eq!(info.usage_percent(), Some(87.0));
    assert_eq!(info.status(), QuotaStatus::Warning);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    checker.get_quota_with_usage("ec2", "L-1216C47A", None).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_quota_with_usage_failure_is_none() {
    let calls = Arc::new(AtomicUsize::new(0));
    let session = routed_session(calls, |_| {
        Err(ApiError::new("NoSuchResourceException", "missing"))
    });
    let checker = ServiceQuotaChecker::new(session, "us-east-1", DEFAULT_CACHE_TTL);

    assert!(checker.get_quota_with_usage("ec2", "L-NOPE", None).is_none());
}

#[test]
fn test_failed_usage_lookup_is_retried() {
    let metric_calls = Arc::new(AtomicUsize::new(0));
    let counter = metric_calls.clone();
    let session = routed_session(Arc::new(AtomicUsize::new(0)), move |request| {
        match (request.service.as_str(), request.operation.as_str()) {
            ("service-quotas", "GetServiceQuota") => Ok(json!({ "Quota": quota_with_metric() })),
            ("cloudwatch", "GetMetricStatistics") => {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ApiError::new("InternalFailure", "metrics unavailable").with_status(500))
                } else {
                    Ok(json!({ "Datapoints": [{"Maximum": 95.0}] }))
                }
            }
            _ => Err(unknown_operation(request)),
        }
    });
    let checker = ServiceQuotaChecker::new(session, "us-east-1", DEFAULT_CACHE_TTL);

    assert!(checker.get_quota_with_usage("ec2", "L-1216C47A", None).is_none());
    assert!(checker.cache().is_empty());

    let info = checker.get_quota_with_usage("ec2", "L-1216C47A", None).unwrap();
    assert_eq!(info.usage_value(), Some(95.0));
    assert_eq!(info.status(), QuotaStatus::Critical);
    assert_eq!(metric_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_metric_without_datapoints_is_cached_as_unknown() {
    let calls = Arc::new(AtomicUsize::new(0));
    let session = routed_session(calls.clone(), |request| {
        match (request.service.as_str(), request.operation.as_str()) {
            ("service-quotas", "GetServiceQuota") => Ok(json!({ "Quota": quota_with_metric() })),
            ("cloudwatch", "GetMetricStatistics") => Ok(json!({ "Datapoints": [] })),
            _ => Err(unknown_operation(request)),
        }
    });
    let checker = ServiceQuotaChecker::new(session, "us-east-1", DEFAULT_CACHE_TTL);

    let info = checker.get_quota_with_usage("ec2", "L-1216C47A", None).unwrap();
    assert_eq!(info.usage_value(), None);
    assert_eq!(info.status(), QuotaStatus::Unknown);

    checker.get_quota_with_usage("ec2", "L-1216C47A", None).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_health_partition() {
    let a = QuotaInfo::new("ec2", "A", "Quota A", 100.0).with_usage(Some(90.0));
    let b = QuotaInfo::new("ec2", "B", "Quota B", 100.0).with_usage(Some(10.0));
    let c = QuotaInfo::new("ec2", "C", "Quota C", 100.0);

    let health = partition_health(&[a.clone(), b.clone(), c.clone()], DEFAULT_WARNING_THRESHOLD);

    assert_eq!(health.ok, vec![b]);
    assert_eq!(health.at_risk, vec![a]);
    assert_eq!(health.unknown, vec![c]);
    assert_eq!(health.total(), 3);
}

#[test]
fn test_zero_limit_is_unknown() {
    let info = QuotaInfo::new("ec2", "Z", "Zero", 0.0).with_usage(Some(3.0));
    assert_eq!(info.usage_percent(), None);
    assert_eq!(info.status(), QuotaStatus::Unknown);
}

#[test]
fn test_status_monotonic_in_usage() {
    let mut previous = QuotaStatus::Unknown;
    for step in 0..=240 {
        let usage = f64::from(step) * 0.5;
        let status = QuotaInfo::new("ec2", "L", "L", 100.0)
            .with_usage(Some(usage))
            .status();
        assert!(status >= previous, "status dropped at {}%", usage);
        previous = status;
    }

    let at = |usage: f64| QuotaInfo::new("ec2", "L", "L", 100.0).with_usage(Some(usage)).status();
    assert_eq!(at(79.99), QuotaStatus::Ok);
    assert_eq!(at(80.0), QuotaStatus::Warning);
    assert_eq!(at(89.99), QuotaStatus::Warning);
    assert_eq!(at(90.0), QuotaStatus::Critical);
    assert_eq!(at(100.0), QuotaStatus::Exceeded);
}

#[test]
fn test_cache_ttl_boundary() {
    let ttl = Duration::from_secs(300);
    let cache = QuotaCache::new(ttl);
    let start = Instant::now();
    cache.insert_at("quotas:ec2:us-east-1", CachedValue::Quotas(Vec::new()), start);

    assert!(cache
        .get_at("quotas:ec2:us-east-1", start + ttl - Duration::from_millis(1))
        .is_some());
    assert!(cache.get_at("quotas:ec2:us-east-1", start + ttl).is_none());
    // expired entries are evicted
    assert!(cache.is_empty());
}

#[test]
fn test_clear_cache_forces_refetch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let session = routed_session(calls.clone(), |_| {
        Ok(json!({ "Quotas": [quota("L-DC2B2D3D", "Buckets", 100.0)] }))
    });
    let checker = ServiceQuotaChecker::new(session, "us-east-1", DEFAULT_CACHE_TTL);

    checker.get_service_quotas("s3");
    checker.get_service_quotas("s3");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    checker.clear_cache();
    checker.get_service_quotas("s3");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_check_quotas_health_without_usage_is_unknown() {
    let calls = Arc::new(AtomicUsize::new(0));
    let session = routed_session(calls, |_| {
        Ok(json!({ "Quotas": [
            quota("L-0263D0A3", "EC2-VPC Elastic IPs", 5.0),
            quota("L-1216C47A", "Running On-Demand Standard instances", 1152.0)
        ] }))
    });
    let checker = ServiceQuotaChecker::new(session, "us-east-1", DEFAULT_CACHE_TTL);

    let health = checker.check_quotas_health("ec2", DEFAULT_WARNING_THRESHOLD);
    assert!(health.ok.is_empty());
    assert!(health.at_risk.is_empty());
    assert_eq!(health.unknown.len(), 2);
}
