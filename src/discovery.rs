//! Discovery provider seam.
//!
//! A provider answers one question: which {address, hardware address} pairs
//! respond on this subnet right now. The scan loop owns scheduling, timeouts
//! and what to do with the answer.

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DiscoveryError;
use crate::models::DiscoveredHost;

/// How a discovery result was obtained. Stored in the scan log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    Arp,
    ArpCache,
    None,
}

impl DiscoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::Arp => "arp",
            DiscoveryMethod::ArpCache => "arp_cache",
            DiscoveryMethod::None => "none",
        }
    }
}

/// Hosts that answered, plus the method that found them.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    pub hosts: Vec<DiscoveredHost>,
    pub method: DiscoveryMethod,
}

impl Discovery {
    pub fn empty() -> Self {
        Self {
            hosts: Vec::new(),
            method: DiscoveryMethod::None,
        }
    }
}

#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Find responding hosts on `subnet`, giving up after `timeout`.
    ///
    /// `retries` is the number of extra probe rounds sent to hosts that stayed
    /// silent. Implementations must not block the async runtime.
    async fn discover(
        &self,
        subnet: Ipv4Network,
        timeout: Duration,
        retries: u32,
    ) -> Result<Discovery, DiscoveryError>;
}

#[async_trait]
impl<P: DiscoveryProvider + ?Sized> DiscoveryProvider for Arc<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn discover(
        &self,
        subnet: Ipv4Network,
        timeout: Duration,
        retries: u32,
    ) -> Result<Discovery, DiscoveryError> {
        (**self).discover(subnet, timeout, retries).await
    }
}

/// Whether a reply should be reported at all.
///
/// Drops link-local and multicast addresses, the broadcast and all-zero
/// hardware addresses, and IPv4 multicast MACs.
pub fn is_reportable(host: &DiscoveredHost) -> bool {
    let ip = host.address;
    let mac = &host.hardware_id;

    !(ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || mac.is_broadcast()
        || mac.is_zero()
        || mac.is_ipv4_multicast())
}

/// Tries `primary`, and `fallback` when the primary cannot run at all.
///
/// A primary that ran but timed out is not retried through the fallback: the
/// time budget for the cycle is already spent.
pub struct FallbackProvider<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> FallbackProvider<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<P, F> DiscoveryProvider for FallbackProvider<P, F>
where
    P: DiscoveryProvider,
    F: DiscoveryProvider,
{
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn discover(
        &self,
        subnet: Ipv4Network,
        timeout: Duration,
        retries: u32,
    ) -> Result<Discovery, DiscoveryError> {
        match self.primary.discover(subnet, timeout, retries).await {
            Ok(found) => Ok(found),
            Err(e) if e.allows_fallback() => {
                tracing::warn!(
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %e,
                    "Primary discovery unavailable, using fallback"
                );
                self.fallback.discover(subnet, timeout, retries).await
            }
            Err(e) => Err(e),
        }
    }
}
