//! Serving statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Requests answered from a partition.
    pub cache_hits: u64,
    /// Cacheable requests that missed every partition.
    pub cache_misses: u64,
    /// Requests sent to the network (bypass, miss, refresh).
    pub network_fetches: u64,
    /// Requests passed through without caching.
    pub bypassed: u64,
    /// Background refreshes that updated an entry.
    pub revalidated: u64,
    /// Background refreshes that failed and left the entry alone.
    pub revalidation_failures: u64,
    /// Degraded responses served (cached root, offline page, emergency record).
    pub fallbacks: u64,
    /// Partition writes that failed and were swallowed.
    pub cache_write_failures: u64,
}

impl StatsSnapshot {
    /// Fraction of cacheable requests answered from a partition.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

/// Lock-free counters updated from concurrent request tasks.
#[derive(Debug, Default)]
pub struct WorkerStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    network_fetches: AtomicU64,
    bypassed: AtomicU64,
    revalidated: AtomicU64,
    revalidation_failures: AtomicU64,
    fallbacks: AtomicU64,
    cache_write_failures: AtomicU64,
}

impl WorkerStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_fetch(&self) {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revalidation(&self, updated: bool) {
        if updated {
            self.revalidated.fetch_add(1, Ordering::Relaxed);
        } else {
            self.revalidation_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_write_failure(&self) {
        self.cache_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            revalidated: self.revalidated.load(Ordering::Relaxed),
            revalidation_failures: self.revalidation_failures.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            cache_write_failures: self.cache_write_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_empty_is_zero() {
        assert!(StatsSnapshot::default().hit_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn counters_accumulate() {
        let stats = WorkerStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_revalidation(true);
        stats.record_revalidation(false);

        let snap = stats.snapshot();
        assert_eq!(snap.cache_hits, 3);
        assert_eq!(snap.revalidated, 1);
        assert_eq!(snap.revalidation_failures, 1);
        assert!((snap.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }
}
