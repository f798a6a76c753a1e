//! Preferred relay region selection.
//!
//! Each region carries its most recent round-trip measurement and a health
//! flag. The preferred region is the healthy region with the lowest
//! latency; ties go to the lowest region id so every node with the same
//! measurements picks the same region.

use crate::RegionId;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Latency and health bookkeeping for relay regions.
#[derive(Debug, Clone, Default)]
pub struct RegionSelector {
    /// Last measured latency per region
    latencies: BTreeMap<RegionId, Duration>,
    /// Regions currently connected and answering
    healthy: BTreeSet<RegionId>,
}

impl RegionSelector {
    /// Create an empty selector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful probe.
    pub fn record_success(&mut self, region: RegionId, latency: Duration) {
        self.latencies.insert(region, latency);
        self.healthy.insert(region);
    }

    /// Mark a region unhealthy. Its last latency is kept for reporting.
    pub fn record_failure(&mut self, region: RegionId) {
        self.healthy.remove(&region);
    }

    /// Forget a region entirely (it left the relay map).
    pub fn remove(&mut self, region: RegionId) {
        self.latencies.remove(&region);
        self.healthy.remove(&region);
    }

    /// Keep only the listed regions.
    pub fn retain(&mut self, regions: &[RegionId]) {
        self.latencies.retain(|id, _| regions.contains(id));
        self.healthy.retain(|id| regions.contains(id));
    }

    /// Whether the region is healthy.
    #[must_use]
    pub fn is_healthy(&self, region: RegionId) -> bool {
        self.healthy.contains(&region)
    }

    /// Last measured latency, if any.
    #[must_use]
    pub fn latency(&self, region: RegionId) -> Option<Duration> {
        self.latencies.get(&region).copied()
    }

    /// Preferred region, or 0 if none is healthy.
    #[must_use]
    pub fn preferred(&self) -> RegionId {
        self.failover_order().first().copied().unwrap_or(0)
    }

    /// Healthy regions ordered by preference.
    #[must_use]
    pub fn failover_order(&self) -> Vec<RegionId> {
        let mut order: Vec<(Duration, RegionId)> = self
            .healthy
            .iter()
            .map(|id| (self.latencies.get(id).copied().unwrap_or(Duration::MAX), *id))
            .collect();
        order.sort();
        order.into_iter().map(|(_, id)| id).collect()
    }

    /// Latencies of healthy regions, in seconds.
    #[must_use]
    pub fn latency_report(&self) -> BTreeMap<RegionId, f64> {
        self.healthy
            .iter()
            .filter_map(|id| self.latencies.get(id).map(|d| (*id, d.as_secs_f64())))
            .collect()
    }
}
