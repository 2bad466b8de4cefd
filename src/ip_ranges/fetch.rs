//! Download published IP range documents.
//!
//! Each provider publishes its ranges at a fixed URL, except Azure, whose
//! Service Tags file is renamed weekly (`ServiceTags_Public_YYYYMMDD.json`).
//! For Azure the fetcher walks back one day at a time until a document with
//! a non-empty `values` list turns up.
//!
//! Downloaded documents are stored as-is; [`MultiProviderIndex`] reads the
//! raw shapes directly.
//!
//! [`MultiProviderIndex`]: crate::ip_ranges::MultiProviderIndex

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Days, NaiveDate, Utc};
use reqwest::Client;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Days searched backwards for the current Azure Service Tags file.
pub const AZURE_LOOKBACK_DAYS: u64 = 35;

const AZURE_URL_PREFIX: &str = "https://download.microsoft.com/download/7/1/d/\
     71d86715-5596-4529-9b13-da13a5de5b63/ServiceTags_Public_";

/// Fixed download location of a provider's range document.
///
/// `None` for Azure (dated file name) and for unknown providers.
pub fn download_url(provider: &str) -> Option<&'static str> {
    match provider {
        "aws" => Some("https://ip-ranges.amazonaws.com/ip-ranges.json"),
        "gcp" => Some("https://www.gstatic.com/ipranges/cloud.json"),
        "oracle" => Some("https://docs.oracle.com/en-us/iaas/tools/public_ip_ranges.json"),
        "cloudflare" => Some("https://api.cloudflare.com/client/v4/ips"),
        "fastly" => Some("https://api.fastly.com/public-ip-list"),
        _ => None,
    }
}

/// Azure Service Tags URL for one publication date.
pub fn azure_url(date: NaiveDate) -> String {
    format!("{}{}.json", AZURE_URL_PREFIX, date.format("%Y%m%d"))
}

/// Candidate Azure publication dates, newest first.
pub fn azure_candidate_dates(today: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    (0..AZURE_LOOKBACK_DAYS).filter_map(move |days| today.checked_sub_days(Days::new(days)))
}

/// HTTP client for range downloads.
pub struct RangeFetcher {
    client: Client,
}

impl RangeFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            return Err(anyhow!("GET {} failed with status {}", url, status));
        }

        serde_json::from_str(&body).with_context(|| format!("Failed to parse JSON from {}", url))
    }

    /// Download one provider's current range document.
    pub async fn fetch(&self, provider: &str) -> Result<Value> {
        if provider == "azure" {
            return self.fetch_azure().await;
        }
        let url = download_url(provider)
            .ok_or_else(|| anyhow!("No download location known for provider '{}'", provider))?;
        self.get_json(url).await
    }

    async fn fetch_azure(&self) -> Result<Value> {
        for date in azure_candidate_dates(Utc::now().date_naive()) {
            let url = azure_url(date);
            match self.get_json(&url).await {
                Ok(data) if has_values(&data) => return Ok(data),
                Ok(_) => tracing::debug!("{} has no service tags", url),
                Err(err) => tracing::debug!("{:#}", err),
            }
        }
        bail!(
            "No Azure Service Tags document published in the last {} days",
            AZURE_LOOKBACK_DAYS
        )
    }

    /// Download `provider` into `dir/<provider>.json`.
    pub async fn fetch_to_dir(&self, provider: &str, dir: &Path) -> Result<PathBuf> {
        let data = self.fetch(provider).await?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;

        let path = dir.join(format!("{}.json", provider));
        let bytes = serde_json::to_vec(&data).context("Failed to serialize range document")?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

fn has_values(data: &Value) -> bool {
    data.get("values")
        .and_then(Value::as_array)
        .is_some_and(|values| !values.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip_ranges::ALL_PROVIDERS;
    use serde_json::json;

    #[test]
    fn test_every_provider_has_a_source() {
        for provider in ALL_PROVIDERS {
            assert!(
                *provider == "azure" || download_url(provider).is_some(),
                "no source for {}",
                provider
            );
        }
        assert!(download_url("azure").is_none());
        assert!(download_url("digitalocean").is_none());
    }

    #[test]
    fn test_azure_url_uses_compact_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let url = azure_url(date);
        assert!(url.starts_with("https://download.microsoft.com/download/7/1/d/"));
        assert!(url.ends_with("/ServiceTags_Public_20240304.json"));
    }

    #[test]
    fn test_azure_candidates_walk_back_newest_first() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let dates: Vec<NaiveDate> = azure_candidate_dates(today).collect();
        assert_eq!(dates.len() as u64, AZURE_LOOKBACK_DAYS);
        assert_eq!(dates[0], today);
        assert_eq!(dates[4], NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert!(dates.windows(2).all(|pair| pair[0] > pair[1]));
    }

    #[test]
    fn test_has_values() {
        assert!(has_values(&json!({"values": [{"name": "AzureCloud"}]})));
        assert!(!has_values(&json!({"values": []})));
        assert!(!has_values(&json!({"changeNumber": 1})));
    }
}
