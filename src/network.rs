use ipnetwork::{IpNetwork, Ipv4Network};
use once_cell::sync::Lazy;
use pnet::datalink::{self, NetworkInterface};
use std::net::{IpAddr, Ipv4Addr};

use crate::error::ConfigError;
use crate::models::{DiscoveredHost, HardwareAddr};

/// Hostname of this machine, read once.
pub static LOCAL_HOSTNAME: Lazy<String> = Lazy::new(|| {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
});

/// Interface and subnet the scan loop sweeps.
#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub interface: NetworkInterface,
    pub subnet: Ipv4Network,
    pub gateway: Option<IpAddr>,
}

impl ScanTarget {
    /// IPv4 address of the scanning interface inside the target subnet.
    pub fn source_ip(&self) -> Option<Ipv4Addr> {
        source_ipv4(&self.interface, self.subnet)
    }

    /// The scanning machine itself, which never answers its own ARP requests.
    pub fn local_host(&self) -> Option<DiscoveredHost> {
        let mac = self.interface.mac?;
        Some(DiscoveredHost {
            address: self.source_ip()?,
            hardware_id: HardwareAddr::from(mac),
            name: Some(format!("{} (This Device)", LOCAL_HOSTNAME.as_str())),
        })
    }
}

/// Interfaces worth scanning from: up, not loopback, with an IPv4 address.
pub fn usable_interfaces() -> Vec<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && !iface.is_loopback())
        .filter(|iface| iface.ips.iter().any(|ip| ip.is_ipv4()))
        .collect()
}

/// Resolve the interface and subnet to scan.
///
/// `interface` picks an interface by name; otherwise the OS default route's
/// interface is used, then the first usable one. `subnet` overrides the
/// interface's own IPv4 network.
pub fn resolve_target(
    interface: Option<&str>,
    subnet: Option<Ipv4Network>,
) -> Result<ScanTarget, ConfigError> {
    let candidates = usable_interfaces();

    let chosen = match interface {
        Some(name) => candidates
            .into_iter()
            .find(|iface| iface.name == name)
            .ok_or_else(|| ConfigError::NoInterface(format!("{name} is not up or has no IPv4 address")))?,
        None => {
            let default_name = default_net::get_default_interface().ok().map(|iface| iface.name);
            let mut candidates = candidates;
            let position = default_name
                .as_deref()
                .and_then(|name| candidates.iter().position(|iface| iface.name == name))
                .unwrap_or(0);
            if candidates.is_empty() {
                return Err(ConfigError::NoInterface("no interface is up with an IPv4 address".into()));
            }
            candidates.swap_remove(position)
        }
    };

    let subnet = match subnet {
        Some(subnet) => subnet,
        None => interface_network(&chosen).ok_or_else(|| {
            ConfigError::NoInterface(format!("{} has no IPv4 network", chosen.name))
        })?,
    };

    let gateway = default_net::get_default_gateway().ok().map(|gw| gw.ip_addr);

    Ok(ScanTarget {
        interface: chosen,
        subnet,
        gateway,
    })
}

/// First IPv4 network configured on `iface`, normalized to its network address.
pub fn interface_network(iface: &NetworkInterface) -> Option<Ipv4Network> {
    iface.ips.iter().find_map(|ip| match ip {
        IpNetwork::V4(net) => Ipv4Network::new(net.network(), net.prefix()).ok(),
        IpNetwork::V6(_) => None,
    })
}

/// IPv4 address of `iface` that lies inside `subnet`, else its first IPv4.
pub fn source_ipv4(iface: &NetworkInterface, subnet: Ipv4Network) -> Option<Ipv4Addr> {
    let v4: Vec<Ipv4Addr> = iface
        .ips
        .iter()
        .filter_map(|ip| match ip.ip() {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        })
        .collect();

    v4.iter()
        .copied()
        .find(|addr| subnet.contains(*addr))
        .or_else(|| v4.first().copied())
}

/// Host addresses of `subnet`, skipping the network and broadcast addresses
/// for prefixes that have them.
pub fn host_addresses(subnet: Ipv4Network) -> impl Iterator<Item = Ipv4Addr> {
    let network = subnet.network();
    let broadcast = subnet.broadcast();
    let has_edges = subnet.prefix() < 31;
    subnet
        .iter()
        .filter(move |addr| !has_edges || (*addr != network && *addr != broadcast))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface_with(ips: Vec<IpNetwork>) -> NetworkInterface {
        NetworkInterface {
            name: "eth0".into(),
            description: String::new(),
            index: 2,
            mac: Some("aa:bb:cc:dd:ee:01".parse().unwrap()),
            ips,
            flags: 0,
        }
    }

    #[test]
    fn test_interface_network_normalizes() {
        let iface = iface_with(vec!["192.168.1.42/24".parse().unwrap()]);
        let net = interface_network(&iface).unwrap();
        assert_eq!(net, "192.168.1.0/24".parse::<Ipv4Network>().unwrap());
    }

    #[test]
    fn test_interface_network_skips_v6() {
        let iface = iface_with(vec![
            "fe80::1/64".parse().unwrap(),
            "10.1.2.3/16".parse().unwrap(),
        ]);
        let net = interface_network(&iface).unwrap();
        assert_eq!(net, "10.1.0.0/16".parse::<Ipv4Network>().unwrap());
    }

    #[test]
    fn test_source_ip_prefers_subnet_match() {
        let iface = iface_with(vec![
            "10.0.0.2/8".parse().unwrap(),
            "192.168.1.42/24".parse().unwrap(),
        ]);
        let subnet: Ipv4Network = "192.168.1.0/24".parse().unwrap();
        assert_eq!(source_ipv4(&iface, subnet), Some(Ipv4Addr::new(192, 168, 1, 42)));
    }

    #[test]
    fn test_host_addresses_skip_edges() {
        let subnet: Ipv4Network = "192.168.1.0/30".parse().unwrap();
        let hosts: Vec<Ipv4Addr> = host_addresses(subnet).collect();
        assert_eq!(hosts, vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 2)]);

        let full: Ipv4Network = "192.168.1.0/24".parse().unwrap();
        assert_eq!(host_addresses(full).count(), 254);
    }

    #[test]
    fn test_local_host_named_after_machine() {
        let target = ScanTarget {
            interface: iface_with(vec!["192.168.1.42/24".parse().unwrap()]),
            subnet: "192.168.1.0/24".parse().unwrap(),
            gateway: None,
        };
        let me = target.local_host().unwrap();
        assert_eq!(me.address, Ipv4Addr::new(192, 168, 1, 42));
        assert_eq!(me.hardware_id.as_str(), "aa:bb:cc:dd:ee:01");
        assert!(me.name.unwrap().ends_with("(This Device)"));
    }

    #[test]
    fn test_local_hostname_matches_os() {
        let expected = hostname::get().unwrap().into_string().unwrap();
        assert!(!LOCAL_HOSTNAME.is_empty());
        if !expected.trim().is_empty() {
            assert_eq!(LOCAL_HOSTNAME.as_str(), expected.trim());
        }
    }
}
