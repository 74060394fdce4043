//! Merge one discovery run into the known device history.
//!
//! Every device that exists in history takes part in every cycle: a hit resets
//! its miss streak, a miss extends it. `total_scans` grows either way, so a
//! device that leaves for good slowly drifts toward `rare`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::categorize::status_for;
use crate::models::{CycleEvents, DeviceRecord, DeviceStatus, DiscoveredHost, HardwareAddr};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// Every known device after this cycle, ordered by network address.
    pub records: Vec<DeviceRecord>,
    pub events: CycleEvents,
}

/// Apply one cycle's hits to `known`.
///
/// Hits are keyed by hardware address; if a sweep reports the same address
/// twice the later entry wins.
pub fn reconcile(
    known: Vec<DeviceRecord>,
    hits: &[DiscoveredHost],
    at: DateTime<Utc>,
    grace_limit: u32,
) -> Reconciliation {
    let mut seen: HashMap<&HardwareAddr, &DiscoveredHost> = HashMap::with_capacity(hits.len());
    for host in hits {
        seen.insert(&host.hardware_id, host);
    }

    let mut events = CycleEvents::default();
    let mut records = Vec::with_capacity(known.len() + seen.len());

    for mut record in known {
        let was_offline = status_for(record.consecutive_offline, grace_limit) == DeviceStatus::Offline;

        match seen.remove(&record.hardware_id) {
            Some(host) => {
                record.total_scans += 1;
                record.scans_online += 1;
                record.consecutive_offline = 0;
                record.address = host.address;
                if host.name.is_some() {
                    record.name = host.name.clone();
                }
                record.last_seen = at;
                record.last_seen_online = Some(at);

                if was_offline {
                    events.became_online.push(record.hardware_id.clone());
                }
            }
            None => {
                record.total_scans += 1;
                record.consecutive_offline += 1;
                record.last_seen = at;

                if record.consecutive_offline == grace_limit {
                    events.became_offline.push(record.hardware_id.clone());
                }
            }
        }

        records.push(record);
    }

    // Whatever is left in `seen` has never been recorded before.
    let mut fresh: Vec<&DiscoveredHost> = seen.into_values().collect();
    fresh.sort_by_key(|host| host.address);
    for host in fresh {
        events.new.push(host.hardware_id.clone());
        records.push(DeviceRecord::first_sighting(host, at));
    }

    records.sort_by(|a, b| {
        a.address
            .cmp(&b.address)
            .then_with(|| a.hardware_id.cmp(&b.hardware_id))
    });

    events.online_count = records.iter().filter(|r| r.consecutive_offline == 0).count();
    events.new_count = events.new.len();
    events.offline_count = records
        .iter()
        .filter(|r| status_for(r.consecutive_offline, grace_limit) == DeviceStatus::Offline)
        .count();

    Reconciliation { records, events }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceCategory;
    use chrono::Duration;
    use std::net::Ipv4Addr;

    const GRACE: u32 = 3;

    fn host(last_octet: u8, mac: &str) -> DiscoveredHost {
        DiscoveredHost {
            address: Ipv4Addr::new(192, 168, 1, last_octet),
            hardware_id: mac.parse().unwrap(),
            name: None,
        }
    }

    fn run(known: Vec<DeviceRecord>, hits: &[DiscoveredHost], cycle: i64) -> Reconciliation {
        let at = DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(cycle);
        reconcile(known, hits, at, GRACE)
    }

    fn assert_invariants(records: &[DeviceRecord]) {
        for r in records {
            assert!(r.scans_online <= r.total_scans, "{:?}", r);
        }
    }

    #[test]
    fn test_first_sighting_creates_record() {
        let d = host(10, "aa:aa:aa:aa:aa:01");
        let out = run(Vec::new(), &[d.clone()], 1);

        assert_eq!(out.records.len(), 1);
        let r = &out.records[0];
        assert_eq!(r.total_scans, 1);
        assert_eq!(r.scans_online, 1);
        assert_eq!(r.consecutive_offline, 0);
        assert_eq!(r.category(), DeviceCategory::New);
        assert_eq!(r.status(GRACE), DeviceStatus::Online);
        assert_eq!(out.events.new, vec![d.hardware_id]);
        assert_eq!(out.events.new_count, 1);
        assert_eq!(out.events.online_count, 1);
    }

    #[test]
    fn test_grace_period_scenario() {
        let d = host(10, "aa:aa:aa:aa:aa:01");
        let mut records = run(Vec::new(), &[d], 1).records;

        // Cycles 2 and 3: still within grace
        for cycle in 2..=3 {
            let out = run(records, &[], cycle);
            assert_eq!(out.records[0].status(GRACE), DeviceStatus::Online, "cycle {cycle}");
            assert!(out.events.became_offline.is_empty());
            records = out.records;
        }

        // Cycle 4: third miss flips it
        let out = run(records, &[], 4);
        let r = &out.records[0];
        assert_eq!(r.status(GRACE), DeviceStatus::Offline);
        assert_eq!(r.total_scans, 4);
        assert_eq!(r.scans_online, 1);
        assert_eq!(r.consecutive_offline, 3);
        assert_eq!(out.events.became_offline, vec![r.hardware_id.clone()]);
        assert_eq!(out.events.offline_count, 1);
        assert_eq!(out.events.online_count, 0);

        // Cycle 5: further misses do not re-announce
        let out = run(out.records, &[], 5);
        assert!(out.events.became_offline.is_empty());
        assert_eq!(out.records[0].consecutive_offline, 4);
    }

    #[test]
    fn test_return_from_offline_resets_streak() {
        let d = host(10, "aa:aa:aa:aa:aa:01");
        let mut records = run(Vec::new(), &[d.clone()], 1).records;
        for cycle in 2..=5 {
            records = run(records, &[], cycle).records;
        }
        assert_eq!(records[0].status(GRACE), DeviceStatus::Offline);

        let out = run(records, &[d.clone()], 6);
        let r = &out.records[0];
        assert_eq!(r.consecutive_offline, 0);
        assert_eq!(r.status(GRACE), DeviceStatus::Online);
        assert_eq!(r.total_scans, 6);
        assert_eq!(r.scans_online, 2);
        assert_eq!(out.events.became_online, vec![d.hardware_id]);
        assert_invariants(&out.records);
    }

    #[test]
    fn test_return_within_grace_is_not_announced() {
        let d = host(10, "aa:aa:aa:aa:aa:01");
        let records = run(Vec::new(), &[d.clone()], 1).records;
        let records = run(records, &[], 2).records;
        let out = run(records, &[d], 3);
        assert!(out.events.became_online.is_empty());
        assert_eq!(out.records[0].consecutive_offline, 0);
    }

    #[test]
    fn test_address_change_keeps_identity() {
        let mut d = host(10, "aa:aa:aa:aa:aa:01");
        let records = run(Vec::new(), &[d.clone()], 1).records;

        d.address = Ipv4Addr::new(192, 168, 1, 77);
        let out = run(records, &[d], 2);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].address, Ipv4Addr::new(192, 168, 1, 77));
        assert_eq!(out.records[0].total_scans, 2);
        assert!(out.events.new.is_empty());
    }

    #[test]
    fn test_name_kept_when_provider_has_none() {
        let mut d = host(10, "aa:aa:aa:aa:aa:01");
        d.name = Some("nas.lan".into());
        let records = run(Vec::new(), &[d.clone()], 1).records;

        d.name = None;
        let out = run(records, &[d], 2);
        assert_eq!(out.records[0].name.as_deref(), Some("nas.lan"));
    }

    #[test]
    fn test_ghost_device_drifts_to_rare() {
        let d = host(10, "aa:aa:aa:aa:aa:01");
        let mut records = run(Vec::new(), &[d.clone()], 1).records;
        for cycle in 2..=6 {
            records = run(records, &[d.clone()], cycle).records;
        }
        assert_eq!(records[0].category(), DeviceCategory::Regular);

        for cycle in 7..=30 {
            records = run(records, &[], cycle).records;
            assert_invariants(&records);
        }
        assert_eq!(records[0].category(), DeviceCategory::Rare);
        assert_eq!(records[0].total_scans, 30);
    }

    #[test]
    fn test_duplicate_hits_collapse() {
        let a = host(10, "aa:aa:aa:aa:aa:01");
        let b = host(11, "aa:aa:aa:aa:aa:01");
        let out = run(Vec::new(), &[a, b], 1);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].address, Ipv4Addr::new(192, 168, 1, 11));
    }

    #[test]
    fn test_records_sorted_by_address() {
        let hits = [
            host(200, "aa:aa:aa:aa:aa:03"),
            host(3, "aa:aa:aa:aa:aa:01"),
            host(20, "aa:aa:aa:aa:aa:02"),
        ];
        let out = run(Vec::new(), &hits, 1);
        let octets: Vec<u8> = out.records.iter().map(|r| r.address.octets()[3]).collect();
        assert_eq!(octets, vec![3, 20, 200]);
    }

    #[test]
    fn test_timestamps_follow_outcome() {
        let d = host(10, "aa:aa:aa:aa:aa:01");
        let first = run(Vec::new(), &[d], 1).records;
        let seen_at = first[0].last_seen_online;

        let out = run(first, &[], 2);
        let r = &out.records[0];
        assert_eq!(r.last_seen_online, seen_at);
        assert_eq!(r.last_seen, DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(2));
        assert_eq!(r.first_seen, DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(1));
    }
}
