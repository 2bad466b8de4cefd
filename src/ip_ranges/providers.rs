//! Cloud provider IP range documents.
//!
//! Loads the published range files of AWS, GCP, Azure, Oracle, Cloudflare
//! and Fastly into one [`IpRangeIndex`].
//!
//! # Supported documents
//!
//! | Provider | Source | Shape |
//! |---|---|---|
//! | `aws` | `ip-ranges.json` | `prefixes[].ip_prefix`, `ipv6_prefixes[].ipv6_prefix` |
//! | `gcp` | `cloud.json` | `prefixes[].ipv4Prefix` / `ipv6Prefix` |
//! | `azure` | Service Tags JSON | `values[].properties.addressPrefixes` |
//! | `oracle` | `public_ip_ranges.json` | `regions[].cidrs[].cidr` |
//! | `cloudflare`, `fastly` | normalised or raw API | `prefixes`, `addresses`, `result` |

use crate::ip_ranges::index::{Backend, IpPrefixData, IpRangeIndex};
use crate::utils::reader::read_json;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub const ALL_PROVIDERS: &[&str] = &["aws", "gcp", "azure", "oracle", "cloudflare", "fastly"];

/// One index across several providers.
#[derive(Debug, Default)]
pub struct MultiProviderIndex {
    index: IpRangeIndex,
    loaded: BTreeSet<String>,
}

impl MultiProviderIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: Backend) -> Self {
        Self {
            index: IpRangeIndex::with_backend(backend),
            loaded: BTreeSet::new(),
        }
    }

    /// Add every prefix in a provider document. Returns the number added.
    ///
    /// Unknown providers add nothing and are not marked as loaded.
    pub fn load_provider(&mut self, provider: &str, data: &Value) -> usize {
        let provider = provider.trim().to_lowercase();
        let added = match provider.as_str() {
            "aws" => self.load_aws(data),
            "gcp" => self.load_gcp(data),
            "azure" => self.load_azure(data),
            "oracle" => self.load_oracle(data),
            "cloudflare" => self.load_cdn(data, "Cloudflare"),
            "fastly" => self.load_cdn(data, "Fastly"),
            other => {
                tracing::warn!("unknown IP range provider '{}', skipping", other);
                return 0;
            }
        };
        tracing::debug!("loaded {} prefixes for {}", added, provider);
        self.loaded.insert(provider);
        added
    }

    /// Read a plain, `.gz` or `.zst` JSON document and load it.
    pub fn load_file(&mut self, provider: &str, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let data = read_json(path)
            .with_context(|| {
                format!("Failed to load {} IP ranges from {}", provider, path.display())
            })?;
        Ok(self.load_provider(provider, &data))
    }

    fn add(
        &mut self,
        prefix: &str,
        provider: &str,
        service: &str,
        region: &str,
        extra: BTreeMap<String, String>,
    ) -> usize {
        usize::from(self.index.add_prefix(prefix, provider, service, region, extra))
    }

    fn load_aws(&mut self, data: &Value) -> usize {
        let mut added = 0;
        for (list, key) in [("prefixes", "ip_prefix"), ("ipv6_prefixes", "ipv6_prefix")] {
            for prefix in array(data, list) {
                let mut extra = BTreeMap::new();
                if let Some(group) = str_field(prefix, "network_border_group") {
                    extra.insert("network_border_group".to_string(), group.to_string());
                }
                added += self.add(
                    str_field(prefix, key).unwrap_or(""),
                    "AWS",
                    str_field(prefix, "service").unwrap_or(""),
                    str_field(prefix, "region").unwrap_or(""),
                    extra,
                );
            }
        }
        added
    }

    fn load_gcp(&mut self, data: &Value) -> usize {
        let mut added = 0;
        for prefix in array(data, "prefixes") {
            let cidr = str_field(prefix, "ipv4Prefix")
                .or_else(|| str_field(prefix, "ipv6Prefix"))
                .unwrap_or("");
            if cidr.is_empty() {
                continue;
            }
            added += self.add(
                cidr,
                "GCP",
                str_field(prefix, "service").unwrap_or("Google Cloud"),
                str_field(prefix, "scope").unwrap_or(""),
                BTreeMap::new(),
            );
        }
        added
    }

    fn load_azure(&mut self, data: &Value) -> usize {
        let mut added = 0;
        for tag in array(data, "values") {
            let service = str_field(tag, "name").unwrap_or("Azure");
            let properties = tag.get("properties");
            let region = properties
                .and_then(|p| str_field(p, "region"))
                .filter(|r| !r.is_empty())
                .unwrap_or("Global");
            let prefixes = properties
                .and_then(|p| p.get("addressPrefixes"))
                .and_then(Value::as_array);
            for cidr in prefixes.into_iter().flatten().filter_map(Value::as_str) {
                added += self.add(cidr, "Azure", service, region, BTreeMap::new());
            }
        }
        added
    }

    fn load_oracle(&mut self, data: &Value) -> usize {
        let mut added = 0;
        for region in array(data, "regions") {
            let region_name = str_field(region, "region").unwrap_or("Unknown");
            for cidr in array(region, "cidrs") {
                let Some(prefix) = str_field(cidr, "cidr") else {
                    continue;
                };
                let tags: Vec<&str> =
                    array(cidr, "tags").iter().filter_map(|t| t.as_str()).collect();
                let service = if tags.is_empty() {
                    "Oracle Cloud".to_string()
                } else {
                    tags.join(", ")
                };
                added += self.add(prefix, "Oracle", &service, region_name, BTreeMap::new());
            }
        }
        added
    }

    fn load_cdn(&mut self, data: &Value, provider: &str) -> usize {
        let default_service = format!("{} CDN", provider);
        let mut added = 0;

        for (list, key) in [("prefixes", "ip_prefix"), ("ipv6_prefixes", "ipv6_prefix")] {
            for prefix in array(data, list) {
                added += self.add(
                    str_field(prefix, key).unwrap_or(""),
                    provider,
                    str_field(prefix, "service").unwrap_or(&default_service),
                    "Global",
                    BTreeMap::new(),
                );
            }
        }

        // raw Fastly and Cloudflare API shapes carry plain string lists
        let raw_lists = [
            data.get("addresses"),
            data.get("ipv6_addresses"),
            data.pointer("/result/ipv4_cidrs"),
            data.pointer("/result/ipv6_cidrs"),
        ];
        for list in raw_lists.into_iter().flatten().filter_map(Value::as_array) {
            for cidr in list.iter().filter_map(Value::as_str) {
                added += self.add(cidr, provider, &default_service, "Global", BTreeMap::new());
            }
        }
        added
    }

    /// Finalise the index after loading.
    pub fn build(&mut self) {
        self.index.build();
    }

    pub fn search(&self, ip: &str) -> Vec<IpPrefixData> {
        self.index.search(ip)
    }

    pub fn search_batch<S: AsRef<str>>(&self, ips: &[S]) -> BTreeMap<String, Vec<IpPrefixData>> {
        self.index.search_batch(ips)
    }

    pub fn prefix_count(&self) -> usize {
        self.index.prefix_count()
    }

    pub fn backend(&self) -> Backend {
        self.index.backend()
    }

    pub fn loaded_providers(&self) -> Vec<String> {
        self.loaded.iter().cloned().collect()
    }
}

fn array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}
