//! Download published IP range documents for `ip-lookup`.
//!
//! Writes `<provider>.json` into the output directory. A failed download is
//! reported and the remaining providers are still fetched.
//!
//! # Usage
//!
//! ```bash
//! aws-audit fetch-ranges --output-dir ranges
//! aws-audit ip-lookup --provider aws=ranges/aws.json 3.5.140.2
//! ```

use crate::ip_ranges::{RangeFetcher, ALL_PROVIDERS};
use anyhow::{bail, Result};
use std::path::Path;
use std::time::Duration;

/// Providers to download: all known ones when `requested` is empty.
pub fn resolve_providers(requested: &[String]) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(ALL_PROVIDERS.iter().map(|p| (*p).to_string()).collect());
    }

    let mut providers = Vec::with_capacity(requested.len());
    for name in requested {
        let name = name.trim().to_lowercase();
        if !ALL_PROVIDERS.contains(&name.as_str()) {
            bail!(
                "Unknown provider '{}'. Known providers: {}",
                name,
                ALL_PROVIDERS.join(", ")
            );
        }
        if !providers.contains(&name) {
            providers.push(name);
        }
    }
    Ok(providers)
}

pub async fn run(requested: &[String], output_dir: &Path, timeout: Duration) -> Result<()> {
    let providers = resolve_providers(requested)?;
    let fetcher = RangeFetcher::new(timeout)?;

    let mut failed = Vec::new();
    for provider in &providers {
        match fetcher.fetch_to_dir(provider, output_dir).await {
            Ok(path) => println!("{:<12} {}", provider, path.display()),
            Err(err) => {
                tracing::warn!("{}: {:#}", provider, err);
                failed.push(provider.as_str());
            }
        }
    }

    if failed.len() == providers.len() {
        bail!("All downloads failed");
    }
    if !failed.is_empty() {
        eprintln!("Failed to download: {}", failed.join(", "));
    }
    Ok(())
}
