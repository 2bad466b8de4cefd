/// Integration tests for the parallel collection engine
/// Targets use in-memory transports; nothing touches the network
use aws_audit_tools::aws::api::{ApiError, ApiRequest};
use aws_audit_tools::aws::session::Session;
use aws_audit_tools::parallel::{
    parallel_collect, CancellationToken, ErrorCategory, ErrorCollector, ParallelConfig,
    RateLimiter, RateLimiterConfig, Target,
};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn session(name: &str) -> Session {
    Session::with_transport(name, |_: &ApiRequest| -> Result<Value, ApiError> { Ok(json!({})) })
}

/// Targets `acct-0` .. `acct-{n-1}` in one region.
fn targets(n: usize) -> Vec<Target> {
    (0..n)
        .map(|i| Target::new(session("audit"), format!("acct-{}", i), Some("us-east-1")))
        .collect()
}

fn index_of(target: &Target) -> usize {
    target
        .identifier()
        .trim_start_matches("acct-")
        .parse()
        .unwrap()
}

#[test]
fn test_order_preserved_under_random_delays() {
    let targets = targets(40);
    let config = ParallelConfig::default().with_max_workers(8).unwrap();

    let result = parallel_collect(
        &targets,
        |target| -> anyhow::Result<usize> {
            let delay = rand::thread_rng().gen_range(0..15);
            thread::sleep(Duration::from_millis(delay));
            Ok(index_of(target))
        },
        &config,
    );

    assert_eq!(result.len(), 40);
    for (i, outcome) in result.outcomes().into_iter().enumerate() {
        assert_eq!(outcome, Some(&i));
    }
    for (i, task) in result.results().iter().enumerate() {
        assert_eq!(task.identifier, format!("acct-{}", i));
    }
}

#[test]
fn test_failures_do_not_abort_run() {
    let targets = targets(12);
    let config = ParallelConfig::default().with_max_workers(4).unwrap();

    let result = parallel_collect(
        &targets,
        |target| -> Result<usize, ApiError> {
            let i = index_of(target);
            match i % 4 {
                0 => Err(ApiError::new("ThrottlingException", "Rate exceeded")),
                1 => Err(ApiError::new("ResourceNotFoundException", "gone")),
                _ => Ok(i),
            }
        },
        &config,
    );

    assert_eq!(result.total_count(), 12);
    assert_eq!(result.success_count(), 6);
    assert_eq!(result.error_count(), 6);

    let summary = result.error_summary();
    assert_eq!(summary[&ErrorCategory::Throttling], 3);
    assert_eq!(summary[&ErrorCategory::NotFound], 3);
    assert!(result.errors().iter().all(|e| e.retries == 0));
}

#[test]
fn test_end_to_end_five_targets() {
    let targets = targets(5);
    let config = ParallelConfig::default()
        .with_max_workers(3)
        .unwrap()
        .with_service("ec2");

    let result = parallel_collect(
        &targets,
        |target| -> Result<Value, ApiError> {
            let i = index_of(target);
            if i == 1 || i == 3 {
                Err(ApiError::new("AccessDeniedException", "not authorized").with_status(400))
            } else {
                Ok(json!({ "count": i }))
            }
        },
        &config,
    );

    let outcomes: Vec<Option<Value>> = result.outcomes().into_iter().map(|o| o.cloned()).collect();
    assert_eq!(
        outcomes,
        vec![
            Some(json!({"count": 0})),
            None,
            Some(json!({"count": 2})),
            None,
            Some(json!({"count": 4})),
        ]
    );

    let summary = result.error_summary();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[&ErrorCategory::AccessDenied], 2);

    let failed = result.failed();
    assert_eq!(failed[0].identifier, "acct-1");
    assert_eq!(failed[1].identifier, "acct-3");
    assert_eq!(result.errors()[0].code, "AccessDeniedException");
    assert!(result.has_any_success());
    assert!(!result.has_failures_only());

    let text = result.error_summary_text();
    assert!(text.starts_with("2 error(s)"));
    assert!(text.contains("AccessDenied: 2"));
    assert!(text.contains("acct-1/us-east-1"));
}

#[test]
fn test_all_failures() {
    let targets = targets(3);
    let result = parallel_collect(
        &targets,
        |_| -> Result<(), ApiError> { Err(ApiError::new("UnauthorizedOperation", "no")) },
        &ParallelConfig::default(),
    );

    assert!(result.has_failures_only());
    assert!(result.data().is_empty());
}

#[test]
fn test_cancellation_fills_remaining_outcomes() {
    let targets = targets(10);
    let token = CancellationToken::new();
    let config = ParallelConfig::default()
        .with_max_workers(1)
        .unwrap()
        .with_cancellation(token.clone());

    let result = parallel_collect(
        &targets,
        |target| -> anyhow::Result<usize> {
            let i = index_of(target);
            if i == 2 {
                token.cancel();
            }
            Ok(i)
        },
        &config,
    );

    assert_eq!(result.len(), 10);
    assert_eq!(result.get(2).and_then(|r| r.value()), Some(&2));

    let cancelled = result
        .errors()
        .into_iter()
        .filter(|e| e.code == "Cancelled")
        .count();
    assert!(cancelled >= 1);
    assert_eq!(cancelled, result.error_count());
    for error in result.errors() {
        assert_eq!(error.category, ErrorCategory::Unknown);
    }
}

#[test]
fn test_rate_limiter_timeout_fails_as_throttled() {
    let targets = targets(3);
    let limiter = RateLimiter::new(
        RateLimiterConfig::new(0.5, 1, Duration::from_millis(50)).unwrap(),
    )
    .unwrap();
    let collector = Arc::new(ErrorCollector::new("ec2"));
    let config = ParallelConfig::default()
        .with_max_workers(1)
        .unwrap()
        .with_rate_limiter(Arc::new(limiter))
        .with_error_collector(collector.clone());

    let calls = AtomicUsize::new(0);
    let result = parallel_collect(
        &targets,
        |_| -> anyhow::Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        &config,
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.success_count(), 1);
    for error in result.errors() {
        assert_eq!(error.code, "RateLimitTimeout");
        assert_eq!(error.category, ErrorCategory::Throttling);
    }
    assert_eq!(collector.summary()[&ErrorCategory::Throttling], 2);
}

#[test]
fn test_cross_product_targets_run_per_region() {
    let sessions = vec![session("dev"), session("prod")];
    let regions = vec!["us-east-1".to_string(), "eu-west-1".to_string(), "ap-south-1".to_string()];
    let targets = Target::cross_product(&sessions, &regions);

    let result = parallel_collect(
        &targets,
        |target| -> anyhow::Result<String> { Ok(target.label()) },
        &ParallelConfig::default(),
    );

    let labels: Vec<&String> = result.data();
    assert_eq!(labels.len(), 6);
    assert_eq!(labels[0], "dev/us-east-1");
    assert_eq!(labels[5], "prod/ap-south-1");
}
