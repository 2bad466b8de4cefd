//! Command implementations for the `aws-audit` binary.
//!
//! Each module exposes a `run` function called from `main` with the parsed
//! CLI arguments.
//!
//! - [`quotas`] - Service quota health across profiles and regions, run in
//!   parallel with usage from CloudWatch and optional CSV export
//! - [`ip_lookup`] - Match addresses against AWS, GCP, Azure, Oracle,
//!   Cloudflare and Fastly published IP ranges
//! - [`fetch_ranges`] - Download the published range documents for `ip-lookup`

pub mod fetch_ranges;
pub mod ip_lookup;
pub mod quotas;
