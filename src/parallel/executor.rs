//! Parallel collection engine.
//!
//! Fans a per-target callback out over a bounded pool of OS threads and
//! gathers one outcome per target, in submission order. A failing or
//! panicking callback never aborts the run; it becomes a classified
//! [`TaskError`] in the result.
//!
//! # Usage
//!
//! ```no_run
//! use aws_audit_tools::parallel::{parallel_collect, ParallelConfig, Target};
//! # fn demo(targets: Vec<Target>) -> anyhow::Result<()> {
//! let config = ParallelConfig::default().with_max_workers(10)?;
//! let result = parallel_collect(&targets, |target| -> anyhow::Result<usize> {
//!     Ok(target.identifier().len())
//! }, &config);
//!
//! println!("{} ok, {} failed", result.success_count(), result.error_count());
//! if result.has_any_failure() {
//!     eprintln!("{}", result.error_summary_text());
//! }
//! # Ok(())
//! # }
//! ```

use crate::parallel::client::ConfigError;
use crate::parallel::errors::{ErrorCategory, ErrorCollector};
use crate::parallel::rate_limiter::RateLimiter;
use crate::parallel::types::{CollectionResult, Target, TaskError, TaskResult};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_WORKERS: usize = 20;
pub const MAX_WORKERS: usize = 100;

/// Shared flag that stops a run from starting new targets.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Receives progress events from a run.
pub trait ProgressTracker: Send + Sync {
    fn set_total(&self, total: usize);

    /// Called once per target, from the worker that finished it.
    fn on_complete(&self, completed: usize, total: usize, target: &Target, success: bool);

    fn finish(&self) {}
}

/// Engine options.
#[derive(Clone)]
pub struct ParallelConfig {
    max_workers: usize,
    service: Option<String>,
    rate_limiter: Option<Arc<RateLimiter>>,
    cancellation: Option<CancellationToken>,
    progress: Option<Arc<dyn ProgressTracker>>,
    error_collector: Option<Arc<ErrorCollector>>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            service: None,
            rate_limiter: None,
            cancellation: None,
            progress: None,
            error_collector: None,
        }
    }
}

impl fmt::Debug for ParallelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelConfig")
            .field("max_workers", &self.max_workers)
            .field("service", &self.service)
            .field("rate_limiter", &self.rate_limiter.as_ref().map(|l| *l.config()))
            .field("cancellable", &self.cancellation.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl ParallelConfig {
    /// Set the pool size. Zero is rejected; values above 100 are clamped.
    pub fn with_max_workers(mut self, max_workers: usize) -> Result<Self, ConfigError> {
        if max_workers == 0 {
            return Err(ConfigError::InvalidWorkers {
                value: max_workers,
                max: MAX_WORKERS,
            });
        }
        if max_workers > MAX_WORKERS {
            tracing::warn!(
                "max_workers {} exceeds the limit, using {}",
                max_workers,
                MAX_WORKERS
            );
        }
        self.max_workers = max_workers.min(MAX_WORKERS);
        Ok(self)
    }

    /// Service name used in log lines and error records.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Pace task starts; a task that cannot get a token in time fails as
    /// throttled.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, tracker: Arc<dyn ProgressTracker>) -> Self {
        self.progress = Some(tracker);
        self
    }

    /// Also record every failure in `collector`.
    #[must_use]
    pub fn with_error_collector(mut self, collector: Arc<ErrorCollector>) -> Self {
        self.error_collector = Some(collector);
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }
}

/// Runs callbacks over targets with a fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct ParallelSessionExecutor {
    config: ParallelConfig,
}

impl ParallelSessionExecutor {
    pub fn new(config: ParallelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    /// Run `callback` once per target and gather the outcomes in order.
    ///
    /// Always returns one outcome per target. Callback errors and panics are
    /// classified and recorded, never propagated.
    pub fn execute<R, E, F>(&self, targets: &[Target], callback: F) -> CollectionResult<R>
    where
        R: Send,
        E: Into<anyhow::Error>,
        F: Fn(&Target) -> Result<R, E> + Send + Sync,
    {
        let started = Instant::now();
        let total = targets.len();
        let service = self.config.service.as_deref().unwrap_or("collection");

        if let Some(progress) = &self.config.progress {
            progress.set_total(total);
        }
        tracing::info!(
            "{}: starting {} task(s) with {} worker(s)",
            service,
            total,
            self.config.max_workers.min(total.max(1))
        );

        let completed = AtomicUsize::new(0);
        let run = || -> Vec<TaskResult<R>> {
            targets
                .par_iter()
                .with_max_len(1)
                .map(|target| self.run_one(target, &callback, &completed, total))
                .collect()
        };

        let results = match ThreadPoolBuilder::new()
            .num_threads(self.config.max_workers)
            .thread_name(|i| format!("collect-{}", i))
            .build()
        {
            Ok(pool) => pool.install(run),
            Err(err) => {
                tracing::warn!("failed to build worker pool ({}), using the global pool", err);
                run()
            }
        };

        if let Some(progress) = &self.config.progress {
            progress.finish();
        }

        let result = CollectionResult::new(results, started.elapsed());
        tracing::info!(
            "{}: finished in {:.2}s, {} succeeded, {} failed",
            service,
            result.total_duration().as_secs_f64(),
            result.success_count(),
            result.error_count()
        );
        result
    }

    fn run_one<R, E, F>(
        &self,
        target: &Target,
        callback: &F,
        completed: &AtomicUsize,
        total: usize,
    ) -> TaskResult<R>
    where
        E: Into<anyhow::Error>,
        F: Fn(&Target) -> Result<R, E>,
    {
        let started = Instant::now();
        let outcome = self.invoke(target, callback);
        let duration = started.elapsed();

        if let Err(err) = &outcome {
            tracing::debug!("{}", err);
        }
        if let Some(progress) = &self.config.progress {
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            progress.on_complete(done, total, target, outcome.is_ok());
        }

        TaskResult {
            identifier: target.identifier().to_string(),
            region: target.region().map(str::to_string),
            outcome,
            duration,
        }
    }

    fn invoke<R, E, F>(&self, target: &Target, callback: &F) -> Result<R, TaskError>
    where
        E: Into<anyhow::Error>,
        F: Fn(&Target) -> Result<R, E>,
    {
        if self.is_cancelled() {
            return Err(TaskError::cancelled(target));
        }

        if let Some(limiter) = &self.config.rate_limiter {
            if !limiter.acquire() {
                let err = TaskError::rate_limited(target);
                self.record(target, &anyhow::anyhow!("{}: {}", err.code, err.message));
                return Err(err);
            }
            // the wait may have outlived the run
            if self.is_cancelled() {
                return Err(TaskError::cancelled(target));
            }
        }

        match catch_unwind(AssertUnwindSafe(|| callback(target))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                let err: anyhow::Error = err.into();
                self.record(target, &err);
                Err(TaskError::from_error(target, &err))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.record(target, &anyhow::anyhow!("callback panicked: {}", message));
                Err(TaskError::new(
                    target,
                    ErrorCategory::Unknown,
                    "Panic",
                    format!("callback panicked: {}", message),
                ))
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.config
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    fn record(&self, target: &Target, err: &anyhow::Error) {
        if let Some(collector) = &self.config.error_collector {
            collector.record(target.identifier(), target.region(), err);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `callback` over `targets` with the given options.
pub fn parallel_collect<R, E, F>(
    targets: &[Target],
    callback: F,
    config: &ParallelConfig,
) -> CollectionResult<R>
where
    R: Send,
    E: Into<anyhow::Error>,
    F: Fn(&Target) -> Result<R, E> + Send + Sync,
{
    ParallelSessionExecutor::new(config.clone()).execute(targets, callback)
}

/// Average task duration of a run, ignoring cancelled targets.
pub fn mean_task_duration<R>(result: &CollectionResult<R>) -> Option<Duration> {
    let timed: Vec<Duration> = result
        .results()
        .iter()
        .filter(|r| r.error().map_or(true, |e| e.code != "Cancelled"))
        .map(|r| r.duration)
        .collect();
    if timed.is_empty() {
        return None;
    }
    Some(timed.iter().sum::<Duration>() / timed.len() as u32)
}
