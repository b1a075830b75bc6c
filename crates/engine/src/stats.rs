//! Cache hit/miss accounting and the monitoring snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free hit/miss counters, shared across the read path.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit and miss rates as fractions of all lookups; both zero before the
    /// first lookup.
    pub fn rates(&self) -> (f64, f64) {
        let hits = self.hits() as f64;
        let misses = self.misses() as f64;
        let total = hits + misses;
        if total == 0.0 {
            (0.0, 0.0)
        } else {
            (hits / total, misses / total)
        }
    }
}

/// Monitoring snapshot returned by `get_cache_statistics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub eviction_count: u64,
    pub key_count_by_prefix: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_are_zero_before_any_lookup() {
        let counters = CacheCounters::new();
        assert_eq!(counters.rates(), (0.0, 0.0));
    }

    #[test]
    fn rates_reflect_recorded_lookups() {
        let counters = CacheCounters::new();
        counters.record_hit();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        let (hit_rate, miss_rate) = counters.rates();
        assert_eq!(hit_rate, 0.75);
        assert_eq!(miss_rate, 0.25);
    }
}
