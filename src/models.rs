use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::categorize::{categorize, status_for};

/// Hardware (MAC) address in lowercase colon-separated form.
///
/// This is the identity key of a device; network addresses move around with
/// DHCP and are never used to key persisted history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HardwareAddr(String);

impl HardwareAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == "ff:ff:ff:ff:ff:ff"
    }

    pub fn is_zero(&self) -> bool {
        self.0 == "00:00:00:00:00:00"
    }

    /// IPv4 multicast MACs live under 01:00:5e.
    pub fn is_ipv4_multicast(&self) -> bool {
        self.0.starts_with("01:00:5e")
    }
}

impl FromStr for HardwareAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(&[':', '-'][..]).collect();
        if parts.len() != 6 {
            return Err(format!("invalid hardware address: {s}"));
        }

        let mut octets = Vec::with_capacity(6);
        for part in parts {
            let byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid hardware address: {s}"))?;
            octets.push(format!("{byte:02x}"));
        }

        Ok(Self(octets.join(":")))
    }
}

impl TryFrom<String> for HardwareAddr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HardwareAddr> for String {
    fn from(value: HardwareAddr) -> Self {
        value.0
    }
}

impl From<pnet::datalink::MacAddr> for HardwareAddr {
    fn from(mac: pnet::datalink::MacAddr) -> Self {
        // MacAddr displays as lowercase colon-separated hex
        Self(mac.to_string())
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current reachability of a device, derived from its miss streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

/// Long-run presence pattern of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCategory {
    New,
    Regular,
    Occasional,
    Rare,
}

impl DeviceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCategory::New => "new",
            DeviceCategory::Regular => "regular",
            DeviceCategory::Occasional => "occasional",
            DeviceCategory::Rare => "rare",
        }
    }
}

/// A host that answered during one discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub address: Ipv4Addr,
    pub hardware_id: HardwareAddr,
    pub name: Option<String>,
}

/// Persisted history of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub address: Ipv4Addr,
    pub hardware_id: HardwareAddr,
    pub name: Option<String>,
    pub note: String,
    pub total_scans: u32,
    pub scans_online: u32,
    pub consecutive_offline: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_seen_online: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    /// Record for a device answering for the very first time.
    pub fn first_sighting(host: &DiscoveredHost, at: DateTime<Utc>) -> Self {
        Self {
            address: host.address,
            hardware_id: host.hardware_id.clone(),
            name: host.name.clone(),
            note: String::new(),
            total_scans: 1,
            scans_online: 1,
            consecutive_offline: 0,
            first_seen: at,
            last_seen: at,
            last_seen_online: Some(at),
        }
    }

    pub fn appearance_rate(&self) -> f64 {
        if self.total_scans == 0 {
            0.0
        } else {
            f64::from(self.scans_online) / f64::from(self.total_scans)
        }
    }

    pub fn category(&self) -> DeviceCategory {
        categorize(self.total_scans, self.scans_online)
    }

    pub fn status(&self, grace_limit: u32) -> DeviceStatus {
        status_for(self.consecutive_offline, grace_limit)
    }
}

/// One completed discovery cycle, as kept in the scan log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub scanned_at: DateTime<Utc>,
    pub devices_found: u32,
    pub method: String,
}

/// Wire view of a device inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceView {
    pub ip: Ipv4Addr,
    pub mac: HardwareAddr,
    pub hostname: Option<String>,
    pub status: DeviceStatus,
    pub category: DeviceCategory,
    pub notes: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_seen_online: Option<DateTime<Utc>>,
    pub total_scans: u32,
    pub scans_online: u32,
    pub consecutive_offline: u32,
    pub appearance_rate: f64,
}

impl DeviceView {
    pub fn from_record(record: &DeviceRecord, grace_limit: u32) -> Self {
        Self {
            ip: record.address,
            mac: record.hardware_id.clone(),
            hostname: record.name.clone(),
            status: record.status(grace_limit),
            category: record.category(),
            notes: record.note.clone(),
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            last_seen_online: record.last_seen_online,
            total_scans: record.total_scans,
            scans_online: record.scans_online,
            consecutive_offline: record.consecutive_offline,
            appearance_rate: record.appearance_rate(),
        }
    }
}

/// The published view of every known device plus cycle metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub devices: Vec<DeviceView>,
    /// Completion time of the last cycle, `None` before the first one.
    pub timestamp: Option<DateTime<Utc>>,
    pub next_scan: Option<DateTime<Utc>>,
    /// Configured interval in seconds.
    pub scan_interval: u64,
    pub scanning: bool,
}

impl Snapshot {
    pub fn empty(scan_interval: u64) -> Self {
        Self {
            devices: Vec::new(),
            timestamp: None,
            next_scan: None,
            scan_interval,
            scanning: false,
        }
    }

    pub fn online_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.status == DeviceStatus::Online)
            .count()
    }

    pub fn device(&self, hardware_id: &HardwareAddr) -> Option<&DeviceView> {
        self.devices.iter().find(|d| &d.mac == hardware_id)
    }
}

/// What changed in one cycle. Feeds log lines and broadcast counts only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleEvents {
    pub new: Vec<HardwareAddr>,
    pub became_offline: Vec<HardwareAddr>,
    pub became_online: Vec<HardwareAddr>,
    pub online_count: usize,
    pub new_count: usize,
    pub offline_count: usize,
}

/// Per-device line of the history view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub ip: Ipv4Addr,
    pub mac: HardwareAddr,
    pub hostname: Option<String>,
    pub total_scans: u32,
    pub scans_seen_online: u32,
    /// Percentage rounded to one decimal.
    pub appearance_rate: f64,
    pub category: DeviceCategory,
    pub notes: String,
}

impl From<&DeviceRecord> for DeviceSummary {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            ip: record.address,
            mac: record.hardware_id.clone(),
            hostname: record.name.clone(),
            total_scans: record.total_scans,
            scans_seen_online: record.scans_online,
            appearance_rate: (record.appearance_rate() * 1000.0).round() / 10.0,
            category: record.category(),
            notes: record.note.clone(),
        }
    }
}

/// Aggregate view over the presence store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total_devices: u64,
    pub total_scans: u64,
    pub active_24h: u64,
    pub devices: Vec<DeviceSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_addr_normalizes() {
        let mac: HardwareAddr = "AA-BB-CC-0D-0E-0F".parse().unwrap();
        assert_eq!(mac.as_str(), "aa:bb:cc:0d:0e:0f");

        let short: HardwareAddr = "a:b:c:d:e:f".parse().unwrap();
        assert_eq!(short.as_str(), "0a:0b:0c:0d:0e:0f");
    }

    #[test]
    fn test_hardware_addr_rejects_garbage() {
        assert!("local".parse::<HardwareAddr>().is_err());
        assert!("aa:bb:cc:dd:ee".parse::<HardwareAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:gg".parse::<HardwareAddr>().is_err());
    }

    #[test]
    fn test_hardware_addr_special_ranges() {
        let bcast: HardwareAddr = "FF:FF:FF:FF:FF:FF".parse().unwrap();
        assert!(bcast.is_broadcast());
        let mcast: HardwareAddr = "01:00:5E:00:00:FB".parse().unwrap();
        assert!(mcast.is_ipv4_multicast());
    }

    #[test]
    fn test_appearance_rate_zero_scans() {
        let host = DiscoveredHost {
            address: Ipv4Addr::new(192, 168, 1, 20),
            hardware_id: "aa:bb:cc:dd:ee:01".parse().unwrap(),
            name: None,
        };
        let mut record = DeviceRecord::first_sighting(&host, Utc::now());
        assert_eq!(record.appearance_rate(), 1.0);
        record.total_scans = 0;
        record.scans_online = 0;
        assert_eq!(record.appearance_rate(), 0.0);
    }

    #[test]
    fn test_summary_rounds_percentage() {
        let host = DiscoveredHost {
            address: Ipv4Addr::new(192, 168, 1, 21),
            hardware_id: "aa:bb:cc:dd:ee:02".parse().unwrap(),
            name: Some("printer".into()),
        };
        let mut record = DeviceRecord::first_sighting(&host, Utc::now());
        record.total_scans = 3;
        record.scans_online = 2;
        let summary = DeviceSummary::from(&record);
        assert_eq!(summary.appearance_rate, 66.7);
    }

    #[test]
    fn test_view_serializes_lowercase_enums() {
        let host = DiscoveredHost {
            address: Ipv4Addr::new(10, 0, 0, 5),
            hardware_id: "aa:bb:cc:dd:ee:03".parse().unwrap(),
            name: None,
        };
        let record = DeviceRecord::first_sighting(&host, Utc::now());
        let json = serde_json::to_value(DeviceView::from_record(&record, 3)).unwrap();
        assert_eq!(json["status"], "online");
        assert_eq!(json["category"], "new");
        assert_eq!(json["mac"], "aa:bb:cc:dd:ee:03");
        assert_eq!(json["ip"], "10.0.0.5");
    }

    #[test]
    fn test_view_and_summary_share_notes_key() {
        let host = DiscoveredHost {
            address: Ipv4Addr::new(10, 0, 0, 6),
            hardware_id: "aa:bb:cc:dd:ee:04".parse().unwrap(),
            name: None,
        };
        let mut record = DeviceRecord::first_sighting(&host, Utc::now());
        record.note = "hallway camera".into();

        let view = serde_json::to_value(DeviceView::from_record(&record, 3)).unwrap();
        let summary = serde_json::to_value(DeviceSummary::from(&record)).unwrap();
        assert_eq!(view["notes"], "hallway camera");
        assert_eq!(summary["notes"], "hallway camera");
        assert!(view.get("note").is_none());
    }
}
