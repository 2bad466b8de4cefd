//! IP range index.
//!
//! Answers "which registered prefixes contain this address?" for tens of
//! thousands of cloud provider prefixes. Two interchangeable backends:
//!
//! - **Radix tree** (`radix-tree` feature, default): a `prefix-trie`
//!   [`PrefixMap`] per address family. Lookups walk the covering prefixes of
//!   the address from least to most specific.
//! - **Sorted array**: prefixes sorted by start address with a running
//!   maximum of end addresses. Lookups binary-search for the last prefix
//!   starting at or before the address, then scan backwards while a prefix
//!   could still reach it. Requires [`IpRangeIndex::build`].
//!
//! Both return the same set of matches. Without the `radix-tree` feature a
//! request for the tree falls back to the sorted array. Malformed input
//! never errors: bad CIDRs are skipped, bad addresses match nothing.
//!
//! # Usage
//!
//! ```
//! use aws_audit_tools::ip_ranges::IpRangeIndex;
//! use std::collections::BTreeMap;
//!
//! let mut index = IpRangeIndex::new();
//! index.add_prefix("10.0.0.0/8", "AWS", "EC2", "us-east-1", BTreeMap::new());
//! index.build();
//!
//! let hits = index.search("10.1.2.3");
//! assert_eq!(hits[0].service, "EC2");
//! ```

use ipnet::IpNet;
#[cfg(feature = "radix-tree")]
use ipnet::{Ipv4Net, Ipv6Net};
#[cfg(feature = "radix-tree")]
use prefix_trie::PrefixMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A registered prefix and its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpPrefixData {
    /// Prefix as given when it was added.
    pub prefix: String,
    /// Parsed prefix with host bits cleared.
    pub network: IpNet,
    pub provider: String,
    pub service: String,
    pub region: String,
    pub extra: BTreeMap<String, String>,
}

/// Lookup structure used by an [`IpRangeIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    RadixTree,
    SortedArray,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::RadixTree => "radix_tree",
            Backend::SortedArray => "binary_search",
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(feature = "radix-tree") {
            Backend::RadixTree
        } else {
            Backend::SortedArray
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "radix" | "radix_tree" | "tree" => Ok(Backend::RadixTree),
            "array" | "sorted" | "binary_search" => Ok(Backend::SortedArray),
            other => Err(format!("unknown backend '{}' (expected radix or array)", other)),
        }
    }
}

/// One prefix map per family; values are indexes into the entry list.
#[cfg(feature = "radix-tree")]
struct PrefixTables {
    v4: PrefixMap<Ipv4Net, Vec<usize>>,
    v6: PrefixMap<Ipv6Net, Vec<usize>>,
}

#[cfg(feature = "radix-tree")]
impl PrefixTables {
    fn new() -> Self {
        Self {
            v4: PrefixMap::new(),
            v6: PrefixMap::new(),
        }
    }

    fn insert(&mut self, network: IpNet, entry: usize) {
        match network {
            IpNet::V4(net) => push_entry(&mut self.v4, net, entry),
            IpNet::V6(net) => push_entry(&mut self.v6, net, entry),
        }
    }

    /// Entries of every prefix covering `addr`, least specific first.
    fn collect(&self, addr: IpAddr) -> Vec<usize> {
        match addr {
            IpAddr::V4(addr) => self
                .v4
                .cover(&Ipv4Net::from(addr))
                .flat_map(|(_, entries)| entries.iter().copied())
                .collect(),
            IpAddr::V6(addr) => self
                .v6
                .cover(&Ipv6Net::from(addr))
                .flat_map(|(_, entries)| entries.iter().copied())
                .collect(),
        }
    }
}

#[cfg(feature = "radix-tree")]
fn push_entry<P: prefix_trie::Prefix>(map: &mut PrefixMap<P, Vec<usize>>, net: P, entry: usize) {
    match map.get_mut(&net) {
        Some(entries) => entries.push(entry),
        None => {
            map.insert(net, vec![entry]);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Range {
    start: u128,
    end: u128,
    entry: usize,
}

#[derive(Debug, Default)]
struct SortedRanges {
    pending: Vec<Range>,
    ranges: Vec<Range>,
    max_end: Vec<u128>,
}

impl SortedRanges {
    fn build(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.ranges.append(&mut self.pending);
        self.ranges.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then(b.end.cmp(&a.end))
                .then(a.entry.cmp(&b.entry))
        });

        let mut running = 0u128;
        self.max_end = self
            .ranges
            .iter()
            .enumerate()
            .map(|(i, r)| {
                running = if i == 0 { r.end } else { running.max(r.end) };
                running
            })
            .collect();
    }

    /// Entries containing `addr`, ascending by start address.
    fn collect(&self, addr: u128) -> Vec<usize> {
        let upper = self.ranges.partition_point(|r| r.start <= addr);
        let mut found = Vec::new();
        for i in (0..upper).rev() {
            if self.max_end[i] < addr {
                break;
            }
            if self.ranges[i].end >= addr {
                found.push(self.ranges[i].entry);
            }
        }
        found.reverse();
        found
    }
}

enum Tables {
    #[cfg(feature = "radix-tree")]
    Tree(PrefixTables),
    Array { v4: SortedRanges, v6: SortedRanges },
}

impl Tables {
    fn new(backend: Backend) -> Self {
        match backend {
            #[cfg(feature = "radix-tree")]
            Backend::RadixTree => Tables::Tree(PrefixTables::new()),
            _ => Tables::Array {
                v4: SortedRanges::default(),
                v6: SortedRanges::default(),
            },
        }
    }

    fn insert(&mut self, network: IpNet, entry: usize) {
        match self {
            #[cfg(feature = "radix-tree")]
            Tables::Tree(tree) => tree.insert(network, entry),
            Tables::Array { v4, v6 } => {
                let (table, start, end) = match network {
                    IpNet::V4(net) => (
                        v4,
                        u128::from(u32::from(net.network())),
                        u128::from(u32::from(net.broadcast())),
                    ),
                    IpNet::V6(net) => (
                        v6,
                        u128::from(net.network()),
                        u128::from(net.broadcast()),
                    ),
                };
                table.pending.push(Range { start, end, entry });
            }
        }
    }

    fn build(&mut self) {
        if let Tables::Array { v4, v6 } = self {
            v4.build();
            v6.build();
        }
    }

    fn collect(&self, addr: IpAddr) -> Vec<usize> {
        match self {
            #[cfg(feature = "radix-tree")]
            Tables::Tree(tree) => tree.collect(addr),
            Tables::Array { v4, v6 } => match addr {
                IpAddr::V4(addr) => v4.collect(u128::from(u32::from(addr))),
                IpAddr::V6(addr) => v6.collect(u128::from(addr)),
            },
        }
    }
}

/// Prefix index over IPv4 and IPv6 (separate tables).
pub struct IpRangeIndex {
    backend: Backend,
    entries: Vec<IpPrefixData>,
    tables: Tables,
}

impl fmt::Debug for IpRangeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpRangeIndex")
            .field("backend", &self.backend)
            .field("prefixes", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl Default for IpRangeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl IpRangeIndex {
    /// Index using the default backend for this build.
    pub fn new() -> Self {
        Self::with_backend(Backend::default())
    }

    /// Index using `backend`, or the sorted array when the tree backend is
    /// not compiled in.
    pub fn with_backend(backend: Backend) -> Self {
        let backend = if backend == Backend::RadixTree && !cfg!(feature = "radix-tree") {
            tracing::warn!("radix-tree backend not compiled in, using binary_search");
            Backend::SortedArray
        } else {
            backend
        };
        Self {
            backend,
            entries: Vec::new(),
            tables: Tables::new(backend),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Register a prefix. Host bits are masked; a bare address is a host
    /// prefix. Returns `false` (and logs) if the prefix does not parse.
    pub fn add_prefix(
        &mut self,
        cidr: &str,
        provider: &str,
        service: &str,
        region: &str,
        extra: BTreeMap<String, String>,
    ) -> bool {
        let Some(network) = parse_network(cidr) else {
            tracing::debug!("skipping invalid prefix '{}' from {}", cidr, provider);
            return false;
        };

        let entry = self.entries.len();
        self.tables.insert(network, entry);

        self.entries.push(IpPrefixData {
            prefix: cidr.trim().to_string(),
            network,
            provider: provider.to_string(),
            service: service.to_string(),
            region: region.to_string(),
            extra,
        });
        true
    }

    /// Make prefixes added so far searchable by the array backend.
    pub fn build(&mut self) {
        self.tables.build();
    }

    /// Every registered prefix containing `ip`. Malformed input → empty.
    pub fn search(&self, ip: &str) -> Vec<IpPrefixData> {
        match ip.trim().parse::<IpAddr>() {
            Ok(addr) => self.search_addr(addr),
            Err(_) => Vec::new(),
        }
    }

    pub fn search_addr(&self, addr: IpAddr) -> Vec<IpPrefixData> {
        self.tables
            .collect(addr)
            .into_iter()
            .filter_map(|i| self.entries.get(i).cloned())
            .collect()
    }

    /// Search several addresses; blank inputs are skipped.
    pub fn search_batch<S: AsRef<str>>(&self, ips: &[S]) -> BTreeMap<String, Vec<IpPrefixData>> {
        ips.iter()
            .map(|ip| ip.as_ref().trim())
            .filter(|ip| !ip.is_empty())
            .map(|ip| (ip.to_string(), self.search(ip)))
            .collect()
    }

    /// Number of prefixes added, built or not.
    pub fn prefix_count(&self) -> usize {
        self.entries.len()
    }
}

fn parse_network(cidr: &str) -> Option<IpNet> {
    let cidr = cidr.trim();
    if cidr.is_empty() {
        return None;
    }
    if let Ok(net) = cidr.parse::<IpNet>() {
        return Some(net.trunc());
    }
    cidr.parse::<IpAddr>().ok().map(IpNet::from)
}
