//! In-memory registry of peer addresses
//!
//! Carries a bootstrap list for when nothing is known yet. The bootstrap
//! format is a list of `host:port` lines grouped by `[stream N]` headers;
//! lines starting with `#` are comments. Hosts are resolved asynchronously
//! with `resolve_bootstrap`.

use dashmap::DashMap;
use log::{debug, warn};
use rand::seq::SliceRandom;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tokio::net::lookup_host;

use super::NodeRegistry;
use crate::core::{unix_time, NetworkAddress, HOUR};

/// Bootstrap nodes of the public network
pub const DEFAULT_BOOTSTRAP: &str = "\
# Public bootstrap nodes
[stream 1]
dissem.ch:8444
bootstrap8080.bitmessage.org:8080
bootstrap8444.bitmessage.org:8444
";

/// Offers larger than this trigger pruning of stale entries
const PRUNE_THRESHOLD: usize = 100;

/// Entries not seen for this long are pruned
const STALE_AFTER: i64 = 3 * HOUR;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid stream header: {0}")]
    InvalidStream(String),
    #[error("Invalid bootstrap entry: {0}")]
    InvalidEntry(String),
}

type NodeKey = ([u8; 16], u16, u64);

/// Address registry backed by a `DashMap`
#[derive(Debug, Default)]
pub struct MemoryNodeRegistry {
    nodes: DashMap<NodeKey, NetworkAddress>,
    bootstrap: Vec<(u64, String)>,
}

impl MemoryNodeRegistry {
    /// Registry without bootstrap nodes; it only knows what it is offered
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_bootstrap() -> Self {
        // The built-in list is well formed
        Self::with_bootstrap(DEFAULT_BOOTSTRAP).unwrap_or_default()
    }

    pub fn with_bootstrap(text: &str) -> Result<Self, RegistryError> {
        Ok(Self {
            nodes: DashMap::new(),
            bootstrap: parse_bootstrap(text)?,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        Self::with_bootstrap(&fs::read_to_string(path)?)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn select(&self, limit: usize, streams: &[u64]) -> Vec<NetworkAddress> {
        let candidates: Vec<NetworkAddress> = self
            .nodes
            .iter()
            .filter(|entry| streams.contains(&entry.value().stream))
            .map(|entry| entry.value().clone())
            .collect();
        candidates
            .choose_multiple(&mut rand::thread_rng(), limit)
            .cloned()
            .collect()
    }
}

impl NodeRegistry for MemoryNodeRegistry {
    fn known_addresses(&self, limit: usize, streams: &[u64]) -> Vec<NetworkAddress> {
        self.select(limit, streams)
    }

    fn offer_addresses(&self, addresses: Vec<NetworkAddress>) {
        let now = unix_time();
        let offered = addresses.len();

        for node in addresses {
            if node.time > now {
                continue;
            }
            self.nodes
                .entry(node.key())
                .and_modify(|known| {
                    if known.time < node.time {
                        known.time = node.time;
                        known.services = node.services;
                    }
                })
                .or_insert(node);
        }

        if offered > PRUNE_THRESHOLD {
            let cutoff = now - STALE_AFTER;
            self.nodes.retain(|_, node| node.time >= cutoff);
        }
    }

    fn bootstrap_hosts(&self) -> Vec<(u64, String)> {
        self.bootstrap.clone()
    }
}

/// Resolve bootstrap entries; unresolvable hosts are skipped
pub async fn resolve_bootstrap(hosts: &[(u64, String)]) -> Vec<NetworkAddress> {
    let now = unix_time();
    let mut result = Vec::new();
    for (stream, host) in hosts {
        debug!("Resolving bootstrap node {}", host);
        match lookup_host(host.as_str()).await {
            Ok(addrs) => {
                result.extend(addrs.map(|addr| NetworkAddress::from_socket_addr(addr, *stream, now)))
            }
            Err(e) => warn!("Cannot resolve bootstrap node {}: {}", host, e),
        }
    }
    result
}

/// Parse bootstrap text into `(stream, "host:port")` pairs
pub fn parse_bootstrap(text: &str) -> Result<Vec<(u64, String)>, RegistryError> {
    let mut stream = 1;
    let mut result = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(header) = line.strip_prefix("[stream") {
            stream = header
                .trim_end_matches(']')
                .trim()
                .parse()
                .map_err(|_| RegistryError::InvalidStream(line.to_string()))?;
            continue;
        }
        match line.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                result.push((stream, line.to_string()));
            }
            _ => return Err(RegistryError::InvalidEntry(line.to_string())),
        }
    }
    Ok(result)
}
