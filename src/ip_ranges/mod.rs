//! Cloud provider IP range lookup.
//!
//! - [`index`] - Prefix index with radix-tree and sorted-array backends
//! - [`providers`] - Loaders for AWS, GCP, Azure, Oracle, Cloudflare and
//!   Fastly range documents
//! - [`fetch`] - Downloads of the published range documents

pub mod fetch;
pub mod index;
pub mod providers;

pub use fetch::RangeFetcher;
pub use index::{Backend, IpPrefixData, IpRangeIndex};
pub use providers::{MultiProviderIndex, ALL_PROVIDERS};
