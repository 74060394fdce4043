use async_trait::async_trait;
use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use pnet::datalink::{self, Channel, MacAddr, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::discovery::{is_reportable, Discovery, DiscoveryMethod, DiscoveryProvider};
use crate::error::DiscoveryError;
use crate::models::{DiscoveredHost, HardwareAddr};
use crate::network::{host_addresses, ScanTarget};

/// Poll period of the capture channel; bounds how late the listener notices
/// the end of a sweep.
const READ_POLL: Duration = Duration::from_millis(100);

/// Sweeps larger than this are refused; the kernel cache covers them instead.
const MAX_SWEEP_HOSTS: usize = 4096;

const ETHERNET_ARP_LEN: usize = 42;
const ARP_LEN: usize = 28;

/// Active ARP sweep over a raw datalink channel.
///
/// Needs raw socket privileges; without them it fails with
/// `PermissionDenied` so a fallback provider can take over.
pub struct ArpScanner {
    target: ScanTarget,
    include_self: bool,
}

impl ArpScanner {
    pub fn new(target: ScanTarget) -> Self {
        Self {
            target,
            include_self: true,
        }
    }

    /// Whether to report the scanning machine itself.
    pub fn include_self(mut self, include: bool) -> Self {
        self.include_self = include;
        self
    }
}

#[async_trait]
impl DiscoveryProvider for ArpScanner {
    fn name(&self) -> &'static str {
        "arp"
    }

    async fn discover(
        &self,
        subnet: Ipv4Network,
        timeout: Duration,
        retries: u32,
    ) -> Result<Discovery, DiscoveryError> {
        let interface = self.target.interface.clone();
        let source_ip = self.target.source_ip().ok_or_else(|| {
            DiscoveryError::Interface(format!("{} has no IPv4 address", interface.name))
        })?;

        tracing::info!(
            interface = %interface.name,
            subnet = %subnet,
            timeout_ms = timeout.as_millis() as u64,
            retries,
            "Starting ARP sweep"
        );

        let mut hosts = tokio::task::spawn_blocking(move || {
            sweep(&interface, source_ip, subnet, timeout, retries)
        })
        .await
        .map_err(|e| DiscoveryError::Channel(format!("sweep task failed: {e}")))??;

        if self.include_self {
            if let Some(me) = self.target.local_host() {
                if !hosts.iter().any(|h| h.hardware_id == me.hardware_id) {
                    hosts.insert(0, me);
                }
            }
        }

        tracing::info!(found = hosts.len(), "ARP sweep complete");

        Ok(Discovery {
            hosts,
            method: DiscoveryMethod::Arp,
        })
    }
}

/// Blocking ARP sweep. Runs on a blocking thread; a listener thread records
/// replies while this one sends requests.
fn sweep(
    interface: &NetworkInterface,
    source_ip: Ipv4Addr,
    subnet: Ipv4Network,
    timeout: Duration,
    retries: u32,
) -> Result<Vec<DiscoveredHost>, DiscoveryError> {
    let source_mac = interface.mac.ok_or_else(|| {
        DiscoveryError::Interface(format!("{} has no hardware address", interface.name))
    })?;

    let targets: Vec<Ipv4Addr> = host_addresses(subnet).filter(|ip| *ip != source_ip).collect();
    if targets.len() > MAX_SWEEP_HOSTS {
        return Err(DiscoveryError::Unsupported(format!(
            "{subnet} has {} hosts, sweep limit is {MAX_SWEEP_HOSTS}",
            targets.len()
        )));
    }

    let config = datalink::Config {
        read_timeout: Some(READ_POLL),
        ..Default::default()
    };

    let (mut tx, mut rx) = match datalink::channel(interface, config) {
        Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => return Err(DiscoveryError::Unsupported("non-ethernet channel".into())),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return Err(DiscoveryError::PermissionDenied(e.to_string()))
        }
        Err(e) => return Err(DiscoveryError::Channel(e.to_string())),
    };

    let replies: Arc<DashMap<Ipv4Addr, HardwareAddr>> = Arc::new(DashMap::new());
    let done = Arc::new(AtomicBool::new(false));

    let listener = {
        let replies = replies.clone();
        let done = done.clone();
        thread::spawn(move || -> io::Result<()> {
            while !done.load(Ordering::Acquire) {
                match rx.next() {
                    Ok(frame) => {
                        if let Some((ip, mac)) = parse_arp_reply(frame) {
                            if subnet.contains(ip) {
                                replies.insert(ip, mac);
                            }
                        }
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::TimedOut
                                | io::ErrorKind::WouldBlock
                                | io::ErrorKind::Interrupted
                        ) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
    };

    let deadline = Instant::now() + timeout;
    let attempts = retries.saturating_add(1);
    let window = timeout / attempts;
    let mut send_result = Ok(());

    'rounds: for attempt in 0..attempts {
        let mut sent = 0usize;
        for &target_ip in &targets {
            if replies.contains_key(&target_ip) {
                continue;
            }
            if let Err(e) = send_arp_request(&mut *tx, source_mac, source_ip, target_ip) {
                send_result = Err(e);
                break 'rounds;
            }
            sent += 1;
        }
        tracing::debug!(attempt, sent, answered = replies.len(), "ARP requests sent");

        let round_end = (Instant::now() + window).min(deadline);
        while Instant::now() < round_end && replies.len() < targets.len() {
            thread::sleep(Duration::from_millis(20));
        }
        if Instant::now() >= deadline || replies.len() >= targets.len() {
            break;
        }
    }

    done.store(true, Ordering::Release);
    match listener.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "ARP listener stopped early"),
        Err(_) => tracing::warn!("ARP listener panicked"),
    }
    send_result?;

    let mut hosts: Vec<DiscoveredHost> = replies
        .iter()
        .map(|entry| DiscoveredHost {
            address: *entry.key(),
            hardware_id: entry.value().clone(),
            name: None,
        })
        .filter(is_reportable)
        .collect();
    hosts.sort_by_key(|h| h.address);

    Ok(hosts)
}

fn send_arp_request(
    tx: &mut dyn datalink::DataLinkSender,
    source_mac: MacAddr,
    source_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Result<(), DiscoveryError> {
    let mut ethernet_buffer = [0u8; ETHERNET_ARP_LEN];
    let mut arp_buffer = [0u8; ARP_LEN];
    write_arp_request(&mut ethernet_buffer, &mut arp_buffer, source_mac, source_ip, target_ip)?;

    match tx.send_to(&ethernet_buffer, None) {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(DiscoveryError::Io(e)),
        None => Err(DiscoveryError::Channel("send buffer unavailable".into())),
    }
}

fn write_arp_request(
    ethernet_buffer: &mut [u8],
    arp_buffer: &mut [u8],
    source_mac: MacAddr,
    source_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Result<(), DiscoveryError> {
    let mut arp_packet = MutableArpPacket::new(arp_buffer)
        .ok_or_else(|| DiscoveryError::Channel("ARP buffer too small".into()))?;

    arp_packet.set_hardware_type(ArpHardwareTypes::Ethernet);
    arp_packet.set_protocol_type(EtherTypes::Ipv4);
    arp_packet.set_hw_addr_len(6);
    arp_packet.set_proto_addr_len(4);
    arp_packet.set_operation(ArpOperations::Request);
    arp_packet.set_sender_hw_addr(source_mac);
    arp_packet.set_sender_proto_addr(source_ip);
    arp_packet.set_target_hw_addr(MacAddr::zero());
    arp_packet.set_target_proto_addr(target_ip);

    let mut ethernet_packet = MutableEthernetPacket::new(ethernet_buffer)
        .ok_or_else(|| DiscoveryError::Channel("ethernet buffer too small".into()))?;

    ethernet_packet.set_destination(MacAddr::broadcast());
    ethernet_packet.set_source(source_mac);
    ethernet_packet.set_ethertype(EtherTypes::Arp);
    ethernet_packet.set_payload(arp_packet.packet());

    Ok(())
}

/// Sender of an ARP reply frame, if `frame` is one.
fn parse_arp_reply(frame: &[u8]) -> Option<(Ipv4Addr, HardwareAddr)> {
    let ethernet_packet = EthernetPacket::new(frame)?;
    if ethernet_packet.get_ethertype() != EtherTypes::Arp {
        return None;
    }

    let arp_packet = ArpPacket::new(ethernet_packet.payload())?;
    if arp_packet.get_operation() != ArpOperations::Reply {
        return None;
    }

    Some((
        arp_packet.get_sender_proto_addr(),
        HardwareAddr::from(arp_packet.get_sender_hw_addr()),
    ))
}

/// Passive discovery from the kernel's neighbour table.
///
/// Needs no privileges but only knows hosts this machine has talked to
/// recently.
pub struct ArpCacheScanner {
    path: PathBuf,
    local_host: Option<DiscoveredHost>,
}

impl ArpCacheScanner {
    pub fn new() -> Self {
        Self::with_path("/proc/net/arp")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            local_host: None,
        }
    }

    /// Report `host` as well; the kernel never lists this machine itself.
    pub fn with_local_host(mut self, host: Option<DiscoveredHost>) -> Self {
        self.local_host = host;
        self
    }
}

impl Default for ArpCacheScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryProvider for ArpCacheScanner {
    fn name(&self) -> &'static str {
        "arp_cache"
    }

    async fn discover(
        &self,
        subnet: Ipv4Network,
        _timeout: Duration,
        _retries: u32,
    ) -> Result<Discovery, DiscoveryError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DiscoveryError::Unsupported(format!(
                    "{} not available on this platform",
                    self.path.display()
                )))
            }
            Err(e) => return Err(DiscoveryError::Io(e)),
        };

        let mut hosts: Vec<DiscoveredHost> = parse_arp_table(&contents)
            .into_iter()
            .filter(|host| subnet.contains(host.address))
            .collect();

        if let Some(me) = &self.local_host {
            if !hosts.iter().any(|h| h.hardware_id == me.hardware_id) {
                hosts.insert(0, me.clone());
            }
        }

        tracing::info!(found = hosts.len(), path = %self.path.display(), "ARP cache read");

        Ok(Discovery {
            hosts,
            method: DiscoveryMethod::ArpCache,
        })
    }
}

/// Parse `/proc/net/arp` content.
///
/// Columns: IP address, HW type, Flags, HW address, Mask, Device. The header
/// line, incomplete entries and filtered addresses are skipped.
pub fn parse_arp_table(contents: &str) -> Vec<DiscoveredHost> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 4 {
                return None;
            }
            let address: Ipv4Addr = columns[0].parse().ok()?;
            let hardware_id: HardwareAddr = columns[3].parse().ok()?;
            Some(DiscoveredHost {
                address,
                hardware_id,
                name: None,
            })
        })
        .filter(is_reportable)
        .collect()
}
