//! Per-server load snapshots used for assignment ranking.
//!
//! Load figures are comparison material only (who is busiest, who has spare
//! capacity), not exact accounting; servers report them best-effort on every
//! heartbeat.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One server's reported load: regions served plus requests handled since
/// the previous report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLoad {
    pub regions: u32,
    pub requests: u32,
}

impl ServerLoad {
    pub fn new(regions: u32, requests: u32) -> Self {
        ServerLoad { regions, requests }
    }
}

impl PartialOrd for ServerLoad {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerLoad {
    /// Total order: region count first, request count second. Callers that
    /// need full determinism break remaining ties by server name.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.regions
            .cmp(&other.regions)
            .then(self.requests.cmp(&other.requests))
    }
}

impl fmt::Display for ServerLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "regions={} requests={}", self.regions, self.requests)
    }
}

/// Mean region count across a set of loads; zero when the set is empty.
pub fn average_regions<'a>(loads: impl Iterator<Item = &'a ServerLoad>) -> f64 {
    let mut total = 0u64;
    let mut count = 0u64;
    for load in loads {
        total += u64::from(load.regions);
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_regions_then_requests() {
        let light = ServerLoad::new(2, 900);
        let heavy = ServerLoad::new(5, 10);
        let busy = ServerLoad::new(5, 400);
        assert!(light < heavy);
        assert!(heavy < busy);
    }

    #[test]
    fn average_handles_empty_set() {
        assert_eq!(average_regions([].iter()), 0.0);
        let loads = [ServerLoad::new(2, 0), ServerLoad::new(4, 0)];
        assert_eq!(average_regions(loads.iter()), 3.0);
    }
}
