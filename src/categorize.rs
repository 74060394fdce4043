//! Device classification from presence counters.

use crate::models::{DeviceCategory, DeviceStatus};

/// Devices with fewer cycles than this are always `new`.
pub const MIN_SCANS_FOR_CATEGORY: u32 = 5;

pub const REGULAR_RATE: f64 = 0.7;
pub const OCCASIONAL_RATE: f64 = 0.3;

/// Missed cycles tolerated before a device is reported offline.
pub const DEFAULT_GRACE_LIMIT: u32 = 3;

/// Map historical counters to a category.
///
/// The sample-size check runs first so a device with one or two misses in its
/// first handful of cycles is not labelled `rare`. Rate bounds are inclusive.
pub fn categorize(total_scans: u32, scans_online: u32) -> DeviceCategory {
    if total_scans < MIN_SCANS_FOR_CATEGORY {
        return DeviceCategory::New;
    }

    let rate = f64::from(scans_online) / f64::from(total_scans);
    if rate >= REGULAR_RATE {
        DeviceCategory::Regular
    } else if rate >= OCCASIONAL_RATE {
        DeviceCategory::Occasional
    } else {
        DeviceCategory::Rare
    }
}

/// A device is offline once its miss streak reaches the grace limit.
pub fn status_for(consecutive_offline: u32, grace_limit: u32) -> DeviceStatus {
    if consecutive_offline >= grace_limit {
        DeviceStatus::Offline
    } else {
        DeviceStatus::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_sample_is_new() {
        assert_eq!(categorize(0, 0), DeviceCategory::New);
        assert_eq!(categorize(1, 1), DeviceCategory::New);
        assert_eq!(categorize(4, 0), DeviceCategory::New);
        assert_eq!(categorize(4, 4), DeviceCategory::New);
    }

    #[test]
    fn test_five_scans_is_classified() {
        assert_eq!(categorize(5, 5), DeviceCategory::Regular);
        assert_eq!(categorize(5, 0), DeviceCategory::Rare);
    }

    #[test]
    fn test_regular_boundary_inclusive() {
        // 7 / 10 is exactly 0.7
        assert_eq!(categorize(10, 7), DeviceCategory::Regular);
        // 6999 / 10000 sits just under
        assert_eq!(categorize(10_000, 6_999), DeviceCategory::Occasional);
    }

    #[test]
    fn test_occasional_boundary_inclusive() {
        assert_eq!(categorize(10, 3), DeviceCategory::Occasional);
        assert_eq!(categorize(10_000, 2_999), DeviceCategory::Rare);
    }

    #[test]
    fn test_status_flips_at_grace_limit() {
        assert_eq!(status_for(0, 3), DeviceStatus::Online);
        assert_eq!(status_for(2, 3), DeviceStatus::Online);
        assert_eq!(status_for(3, 3), DeviceStatus::Offline);
        assert_eq!(status_for(40, 3), DeviceStatus::Offline);
    }
}
