//! Parallel multi-account, multi-region collection.
//!
//! - [`executor`] - Bounded worker pool that runs one callback per target
//! - [`client`] - Client factory with SDK retry modes and pool sizing
//! - [`quotas`] - Service quota checker with a TTL cache
//! - [`errors`] - Error classification and collection
//! - [`rate_limiter`] - Pacing of task starts on a `governor` limiter
//! - [`types`] - Targets and results
//!
//! # Example
//!
//! ```no_run
//! use aws_audit_tools::aws::session::Session;
//! use aws_audit_tools::parallel::{get_client, parallel_collect, ParallelConfig, Target};
//! # fn demo(sessions: Vec<Session>) -> anyhow::Result<()> {
//! let regions = vec!["us-east-1".to_string(), "eu-west-1".to_string()];
//! let targets = Target::cross_product(&sessions, &regions);
//!
//! let result = parallel_collect(&targets, |target| -> anyhow::Result<usize> {
//!     let client = get_client(target, "service-quotas", None)?;
//!     let params = serde_json::json!({"ServiceCode": "ec2"});
//!     let pages = client.paginate("ListServiceQuotas", params, "NextToken")?;
//!     Ok(pages.len())
//! }, &ParallelConfig::default());
//!
//! println!("{:?}", result.error_summary());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod errors;
pub mod executor;
pub mod quotas;
pub mod rate_limiter;
pub mod types;

pub use client::{
    client_for_session, get_client, Client, ClientConfig, ClientConfigOverrides, ConfigError,
    RetryMode,
};
pub use errors::{classify, ErrorCategory, ErrorCollector};
pub use executor::{
    parallel_collect, CancellationToken, ParallelConfig, ParallelSessionExecutor, ProgressTracker,
};
pub use quotas::{QuotaHealth, QuotaInfo, QuotaStatus, ServiceQuotaChecker};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use types::{CollectionResult, Target, TaskError, TaskResult};
