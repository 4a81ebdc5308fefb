//! Health tracking for pool proxies
//!
//! Increment-only success/failure counters, written by workers at their
//! completion points and read only for observability. Records are created
//! lazily and never evicted.

use dashmap::DashMap;

use crate::models::ProxyEndpoint;

/// Cumulative counters for one proxy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthRecord {
    pub success: u64,
    pub fail: u64,
}

/// Process-wide success/failure counters keyed by proxy
#[derive(Debug, Default)]
pub struct HealthTracker {
    records: DashMap<String, HealthRecord>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn record_success(&self, proxy: &ProxyEndpoint) {
        self.records
            .entry(proxy.as_str().to_string())
            .and_modify(|r| r.success += 1)
            .or_insert(HealthRecord {
                success: 1,
                fail: 0,
            });
    }

    pub fn record_failure(&self, proxy: &ProxyEndpoint) {
        self.records
            .entry(proxy.as_str().to_string())
            .and_modify(|r| r.fail += 1)
            .or_insert(HealthRecord {
                success: 0,
                fail: 1,
            });
    }

    /// Counters for one proxy (zeroes if it was never attempted)
    pub fn get(&self, proxy: &ProxyEndpoint) -> HealthRecord {
        self.records
            .get(proxy.as_str())
            .map(|r| *r)
            .unwrap_or_default()
    }

    /// Aggregate (success, fail) across every proxy ever attempted
    pub fn totals(&self) -> (u64, u64) {
        self.records.iter().fold((0, 0), |(s, f), r| {
            (s + r.success, f + r.fail)
        })
    }

    /// Number of distinct proxies ever attempted
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }
}
