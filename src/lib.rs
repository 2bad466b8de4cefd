//! # AWS Audit Tools
//!
//! Multi-account, multi-region AWS collection with rate and quota awareness,
//! plus cloud provider IP range lookup.
//!
//! ## Overview
//!
//! Auditing an AWS estate means running the same read-only calls against
//! every account and region. This crate runs those calls on a bounded worker
//! pool and keeps going when individual targets fail: every target yields
//! either data or a classified error, and results come back in target order.
//!
//! ## Features
//!
//! - **Parallel collection** - Bounded worker pool, cancellation, progress
//!   reporting and token-bucket pacing of task starts
//! - **Client factory** - AWS SDK clients with legacy, standard or adaptive
//!   retries, connection pool sizing and timeouts
//! - **Service quota checks** - Applied and default quotas with a TTL cache,
//!   CloudWatch usage and health partitioning
//! - **Error classification** - Throttling, access denied, not found,
//!   transient and unknown, with per-category summaries
//! - **IP range lookup** - Radix-tree or sorted-array index over AWS, GCP,
//!   Azure, Oracle, Cloudflare and Fastly published ranges, plus downloads
//!   of the current documents
//! - **Compressed inputs** - `.gz` and `.zst` range documents
//! - **Shell completion** for bash, zsh, fish, powershell, and elvish
//!
//! ## Architecture
//!
//! - [`aws`] - Sessions, API seams and the AWS SDK transport
//! - [`parallel`] - Collection engine, client factory, quota checker and
//!   error handling
//! - [`ip_ranges`] - IP prefix index, provider loaders and downloads
//! - [`commands`] - CLI command implementations
//! - [`utils`] - Progress bars, compressed readers and formatting
//!
//! ## Example Usage
//!
//! ```bash
//! # EC2 quota health in three regions of two accounts
//! aws-audit quotas --service ec2 --profiles prod,staging \
//!     --regions us-east-1,eu-west-1,ap-south-1
//!
//! # Which provider owns these addresses?
//! aws-audit fetch-ranges --providers aws --output-dir ranges
//! aws-audit ip-lookup --provider aws=ranges/aws.json 3.5.140.2
//! ```
//!
//! ## Library Usage
//!
//! ```no_run
//! use aws_audit_tools::ip_ranges::MultiProviderIndex;
//!
//! let mut index = MultiProviderIndex::new();
//! index.load_file("aws", "ip-ranges.json").unwrap();
//! index.build();
//! for hit in index.search("3.5.140.2") {
//!     println!("{} {} {}", hit.provider, hit.region, hit.service);
//! }
//! ```

pub mod aws;
pub mod commands;
pub mod ip_ranges;
pub mod parallel;
pub mod utils;
