//! Look up which cloud provider ranges contain an address.
//!
//! Loads one or more published range documents (plain, `.gz` or `.zst`)
//! and reports every matching prefix per address.
//!
//! # Usage
//!
//! ```bash
//! # AWS only
//! aws-audit ip-lookup --provider aws=ip-ranges.json 3.5.140.2 52.94.76.10
//!
//! # Several providers, JSON output, sorted-array backend
//! aws-audit ip-lookup \
//!     --provider aws=ip-ranges.json.gz \
//!     --provider gcp=cloud.json \
//!     --provider cloudflare=cloudflare.json \
//!     --backend array --format json 104.16.0.1 34.1.210.1
//! ```

use crate::ip_ranges::{Backend, IpPrefixData, MultiProviderIndex};
use crate::utils::format::format_number;
use crate::utils::progress::ProgressBar;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Report format for lookup results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// `name=path` pair from `--provider`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSource {
    pub name: String,
    pub path: String,
}

impl FromStr for ProviderSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, path) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected PROVIDER=PATH, got '{}'", s))?;
        let (name, path) = (name.trim(), path.trim());
        if name.is_empty() || path.is_empty() {
            return Err(anyhow!("Expected PROVIDER=PATH, got '{}'", s));
        }
        Ok(Self {
            name: name.to_lowercase(),
            path: path.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct LookupReport<'a> {
    backend: &'a str,
    providers: Vec<String>,
    prefix_count: usize,
    results: &'a BTreeMap<String, Vec<IpPrefixData>>,
}

pub fn run(
    sources: &[ProviderSource],
    ips: &[String],
    backend: &str,
    format: OutputFormat,
) -> Result<()> {
    let backend = Backend::from_str(backend).map_err(anyhow::Error::msg)?;
    let index = load_index(sources, backend)?;
    let results = index.search_batch(ips);

    match format {
        OutputFormat::Json => {
            let report = LookupReport {
                backend: index.backend().as_str(),
                providers: index.loaded_providers(),
                prefix_count: index.prefix_count(),
                results: &results,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to serialize lookup results")?
            );
        }
        OutputFormat::Text => print_text(&results),
    }
    Ok(())
}

/// Load every source into one index and build it.
pub fn load_index(sources: &[ProviderSource], backend: Backend) -> Result<MultiProviderIndex> {
    let mut index = MultiProviderIndex::with_backend(backend);
    let spinner = ProgressBar::new_spinner("Loading IP ranges");

    for source in sources {
        let added = index.load_file(&source.name, &source.path)?;
        spinner.println(format!(
            "  {:<12} {:>10} prefixes from {}",
            source.name,
            format_number(added),
            source.path
        ));
    }

    index.build();
    spinner.finish_with_message(&format!(
        "Loaded {} prefixes ({} backend)",
        format_number(index.prefix_count()),
        index.backend()
    ));
    Ok(index)
}

fn print_text(results: &BTreeMap<String, Vec<IpPrefixData>>) {
    println!("\n{}", "=".repeat(100));
    println!(
        "{:<40} {:<12} {:<24} {:<20} {}",
        "Address", "Provider", "Prefix", "Region", "Service"
    );
    println!("{}", "=".repeat(100));

    for (ip, matches) in results {
        if matches.is_empty() {
            println!("{:<40} (no match)", ip);
            continue;
        }
        for data in matches {
            println!(
                "{:<40} {:<12} {:<24} {:<20} {}",
                ip, data.provider, data.prefix, data.region, data.service
            );
        }
    }

    let matched = results.values().filter(|m| !m.is_empty()).count();
    eprintln!(
        "\n{} of {} address(es) matched a provider range",
        format_number(matched),
        format_number(results.len())
    );
}
