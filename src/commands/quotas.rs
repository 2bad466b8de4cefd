//! Service quota health across profiles and regions.
//!
//! Runs one quota check per profile and region in parallel, attaches
//! CloudWatch usage where the quota publishes a usage metric, and reports the
//! quotas at or above the warning threshold.
//!
//! # Usage
//!
//! ```bash
//! # All EC2 quotas in the regions from AWS_REGION, default credential chain
//! aws-audit quotas --service ec2
//!
//! # Only the well-known quotas, two profiles, three regions, stricter threshold
//! aws-audit quotas --service lambda --common --profiles prod,staging \
//!     --regions us-east-1,eu-west-1,ap-south-1 --threshold 70
//!
//! # One quota by name, exported to CSV
//! aws-audit quotas --service ec2 --quota "Running On-Demand" --output ec2_quotas.csv
//! ```
//!
//! # Output
//!
//! - Per-region summary: ok / at risk / unknown counts
//! - Table of at-risk quotas sorted by usage
//! - Error summary for regions that failed (access denied, throttling, ...)
//! - Optional CSV with one row per quota, profile and region
//!
//! The first Ctrl-C stops scheduling new regions and lets in-flight checks
//! finish; a second one exits immediately.

use crate::aws::api::DEFAULT_REGION;
use crate::aws::session::{regions_from_env, Session};
use crate::parallel::executor::mean_task_duration;
use crate::parallel::quotas::{
    common_quotas, partition_health, QuotaCheckerRegistry, QuotaHealth,
};
use crate::parallel::{
    parallel_collect, CancellationToken, CollectionResult, ErrorCollector, ParallelConfig,
    QuotaInfo, Target,
};
use crate::utils::format::{format_duration, format_number, format_percent};
use crate::utils::progress::ProgressBar;
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Exit status after a second interrupt (128 + SIGINT).
pub const ABORT_EXIT_CODE: i32 = 130;

/// Quotas checked for one profile in one region.
#[derive(Debug, Clone)]
pub struct RegionReport {
    pub profile: String,
    pub region: String,
    pub quotas: Vec<QuotaInfo>,
}

/// Command options, straight from the CLI flags.
#[derive(Debug, Clone)]
pub struct QuotaOptions {
    pub service: String,
    /// Shared-config profiles; empty means the default provider chain.
    pub profiles: Vec<String>,
    pub regions: Vec<String>,
    pub threshold: f64,
    pub common: bool,
    pub quota: Option<String>,
    pub workers: usize,
    pub output: Option<String>,
}

/// How an interrupt watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The signal source went away.
    Closed,
    /// A second interrupt arrived after cancellation.
    Abort,
}

/// Cancel `token` on the first signal and return [`Interrupt::Abort`] on the
/// second.
pub async fn watch_interrupts<F, Fut>(mut next_signal: F, token: CancellationToken) -> Interrupt
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    if next_signal().await.is_err() {
        return Interrupt::Closed;
    }
    eprintln!("\nInterrupted, finishing in-flight regions (Ctrl-C again to abort)...");
    token.cancel();

    match next_signal().await {
        Ok(()) => Interrupt::Abort,
        Err(_) => Interrupt::Closed,
    }
}

pub fn run(options: &QuotaOptions, runtime: Handle) -> Result<()> {
    let sessions = load_sessions(&options.profiles, &runtime);
    let regions = resolve_regions(&options.regions);
    let profile_names: Vec<&str> = sessions.iter().map(Session::profile_name).collect();

    eprintln!(
        "Checking {} quotas for profile(s) {} in {} region(s)",
        options.service,
        profile_names.join(", "),
        regions.len()
    );

    let targets = Target::cross_product(&sessions, &regions);

    let token = CancellationToken::new();
    let signal_token = token.clone();
    runtime.spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, signal_token).await == Interrupt::Abort {
            eprintln!("Aborted");
            std::process::exit(ABORT_EXIT_CODE);
        }
    });

    let progress = Arc::new(ProgressBar::new(targets.len(), "Checking quotas"));
    let collector = Arc::new(ErrorCollector::new("service-quotas"));
    let config = ParallelConfig::default()
        .with_max_workers(options.workers)?
        .with_service("service-quotas")
        .with_cancellation(token)
        .with_progress(progress.clone())
        .with_error_collector(collector.clone());

    let registry = QuotaCheckerRegistry::default();
    let result = parallel_collect(
        &targets,
        |target| check_region(&registry, target, options),
        &config,
    );

    progress.finish_with_message("Quota check complete");

    print_report(&result, options.threshold);

    if let Some(path) = &options.output {
        let rows = write_csv(path, &result.data())?;
        eprintln!(
            "\n[SUCCESS] Exported {} quota rows to: {}",
            format_number(rows),
            path
        );
    }

    if result.has_failures_only() {
        bail!(
            "Quota check failed for all {} profile/region pair(s)\n{}",
            result.total_count(),
            collector.to_text()
        );
    }
    Ok(())
}

/// One session per profile, or one for the default chain.
///
/// Must be called from a blocking thread: loading drives the runtime.
fn load_sessions(profiles: &[String], runtime: &Handle) -> Vec<Session> {
    if profiles.is_empty() {
        return vec![runtime.block_on(Session::load(None, runtime.clone()))];
    }
    profiles
        .iter()
        .map(|profile| runtime.block_on(Session::load(Some(profile), runtime.clone())))
        .collect()
}

fn resolve_regions(requested: &[String]) -> Vec<String> {
    if !requested.is_empty() {
        return requested.to_vec();
    }
    let from_env = regions_from_env();
    if from_env.is_empty() {
        vec![DEFAULT_REGION.to_string()]
    } else {
        from_env
    }
}

fn check_region(
    registry: &QuotaCheckerRegistry,
    target: &Target,
    options: &QuotaOptions,
) -> Result<RegionReport> {
    let region = target.region().unwrap_or(DEFAULT_REGION);
    let checker = registry.get(target.session(), region);
    let service = options.service.as_str();

    let quotas: Vec<QuotaInfo> = if let Some(name) = &options.quota {
        checker.get_quota(service, name).into_iter().collect()
    } else if options.common {
        let codes = common_quotas(service);
        if codes.is_empty() {
            bail!("No well-known quotas are listed for service '{}'", service);
        }
        codes
            .iter()
            .filter_map(|(code, _)| checker.get_quota_with_usage(service, code, None))
            .collect()
    } else {
        checker.attach_usage(&checker.get_service_quotas(service))
    };

    if quotas.is_empty() {
        bail!("No quotas returned for {} in {}", service, region);
    }

    Ok(RegionReport {
        profile: target.session().profile_name().to_string(),
        region: region.to_string(),
        quotas,
    })
}

fn print_report(result: &CollectionResult<RegionReport>, threshold: f64) {
    println!("\n{}", "=".repeat(100));
    println!("SERVICE QUOTA HEALTH (threshold {:.0}%)", threshold);
    println!("{}", "=".repeat(100));
    println!(
        "{:<20} {:<20} {:>8} {:>8} {:>8} {:>8}",
        "Profile", "Region", "Total", "OK", "At risk", "Unknown"
    );
    println!("{}", "-".repeat(100));

    let mut at_risk: Vec<(&RegionReport, QuotaInfo)> = Vec::new();
    for report in result.data() {
        let health: QuotaHealth = partition_health(&report.quotas, threshold);
        println!(
            "{:<20} {:<20} {:>8} {:>8} {:>8} {:>8}",
            truncate(&report.profile, 20),
            report.region,
            health.total(),
            health.ok.len(),
            health.at_risk.len(),
            health.unknown.len()
        );
        at_risk.extend(health.at_risk.into_iter().map(|q| (report, q)));
    }

    if !at_risk.is_empty() {
        at_risk.sort_by(|a, b| {
            b.1.usage_percent()
                .partial_cmp(&a.1.usage_percent())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        println!("\nAt-risk quotas:");
        println!(
            "{:<12} {:<16} {:<12} {:<34} {:>8} {:>8} {:>8}",
            "Profile", "Region", "Code", "Name", "Usage", "Limit", "Used"
        );
        println!("{}", "-".repeat(100));
        for (report, quota) in &at_risk {
            println!(
                "{:<12} {:<16} {:<12} {:<34} {:>8.0} {:>8.0} {:>8}",
                truncate(&report.profile, 12),
                report.region,
                quota.quota_code(),
                truncate(quota.quota_name(), 34),
                quota.usage_value().unwrap_or(0.0),
                quota.value(),
                format_percent(quota.usage_percent())
            );
        }
    }

    eprintln!(
        "\nRegions: {} ok, {} failed in {}",
        result.success_count(),
        result.error_count(),
        format_duration(result.total_duration())
    );
    if let Some(mean) = mean_task_duration(result) {
        eprintln!("Mean region check time: {}", format_duration(mean));
    }
    if result.has_any_failure() {
        eprintln!("\n{}", result.error_summary_text());
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let cut: String = text.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

/// Write one row per quota, profile and region. Returns the number of rows.
pub fn write_csv(path: &str, reports: &[&RegionReport]) -> Result<usize> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create output directory")?;
        }
    }

    let file =
        File::create(path).with_context(|| format!("Failed to create output file: {}", path))?;
    let mut writer = csv::Writer::from_writer(file);

    writer.write_record([
        "profile",
        "region",
        "service_code",
        "quota_code",
        "quota_name",
        "value",
        "usage",
        "usage_percent",
        "status",
        "adjustable",
    ])?;

    let mut rows = 0;
    for report in reports {
        for quota in &report.quotas {
            writer.write_record([
                report.profile.as_str(),
                report.region.as_str(),
                quota.service_code(),
                quota.quota_code(),
                quota.quota_name(),
                &quota.value().to_string(),
                &quota.usage_value().map(|u| u.to_string()).unwrap_or_default(),
                &quota
                    .usage_percent()
                    .map(|p| format!("{:.2}", p))
                    .unwrap_or_default(),
                quota.status().as_str(),
                &quota.adjustable().to_string(),
            ])?;
            rows += 1;
        }
    }

    writer.flush()?;
    Ok(rows)
}
