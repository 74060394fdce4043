//! Reverse name lookup for discovered hosts.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use ipnetwork::Ipv4Network;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use crate::discovery::{Discovery, DiscoveryProvider};
use crate::error::DiscoveryError;
use crate::models::DiscoveredHost;

/// Lookups running at once during one cycle.
const RESOLVE_CONCURRENCY: usize = 64;

#[async_trait]
pub trait HostnameResolver: Send + Sync {
    /// Name for `address`, or `None` when it has none or the lookup failed.
    async fn resolve(&self, address: Ipv4Addr) -> Option<String>;
}

/// Reverse DNS through the system resolver.
#[derive(Debug, Clone)]
pub struct DnsResolver {
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl HostnameResolver for DnsResolver {
    async fn resolve(&self, address: Ipv4Addr) -> Option<String> {
        let lookup =
            tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&IpAddr::V4(address)));
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(Ok(name))) => clean_name(&name, address),
            Ok(Ok(Err(e))) => {
                tracing::trace!(%address, error = %e, "Reverse lookup failed");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(%address, error = %e, "Reverse lookup task failed");
                None
            }
            Err(_) => {
                tracing::trace!(%address, "Reverse lookup timed out");
                None
            }
        }
    }
}

/// Strip the trailing root dot; a name that just echoes the address is no name.
pub fn clean_name(name: &str, address: Ipv4Addr) -> Option<String> {
    let name = name.trim().trim_end_matches('.');
    if name.is_empty() || name == address.to_string() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Fills in names for hosts the inner provider left unnamed.
///
/// Answers are remembered per address for `ttl`, misses included, so a quiet
/// resolver costs one timeout per host per `ttl` rather than per cycle.
pub struct NamingProvider<P, R> {
    inner: P,
    resolver: R,
    ttl: Duration,
    cache: DashMap<Ipv4Addr, (Option<String>, Instant)>,
}

impl<P, R> NamingProvider<P, R> {
    pub fn new(inner: P, resolver: R) -> Self {
        Self {
            inner,
            resolver,
            ttl: Duration::from_secs(600),
            cache: DashMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

impl<P, R: HostnameResolver> NamingProvider<P, R> {
    async fn name_for(&self, address: Ipv4Addr) -> Option<String> {
        if let Some(entry) = self.cache.get(&address) {
            let (name, at) = entry.value();
            if at.elapsed() < self.ttl {
                return name.clone();
            }
        }
        let name = self.resolver.resolve(address).await;
        self.cache.insert(address, (name.clone(), Instant::now()));
        name
    }
}

#[async_trait]
impl<P, R> DiscoveryProvider for NamingProvider<P, R>
where
    P: DiscoveryProvider,
    R: HostnameResolver,
{
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn discover(
        &self,
        subnet: Ipv4Network,
        timeout: Duration,
        retries: u32,
    ) -> Result<Discovery, DiscoveryError> {
        let Discovery { hosts, method } = self.inner.discover(subnet, timeout, retries).await?;

        let hosts: Vec<DiscoveredHost> = stream::iter(hosts)
            .map(|mut host| async move {
                if host.name.is_none() {
                    host.name = self.name_for(host.address).await;
                }
                host
            })
            .buffered(RESOLVE_CONCURRENCY)
            .collect()
            .await;

        Ok(Discovery { hosts, method })
    }
}
