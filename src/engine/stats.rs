// Fetch statistics: transfers, cache hits, fallbacks and peak parallelism.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub network_fetches: u64,
    pub cache_hits: u64,
    pub not_modified: u64,
    pub authoring_loads: u64,
    pub fallback_loads: u64,
    pub failures: u64,
    pub downloaded_bytes: u64,
    pub active_transfers: u32,
    pub peak_transfers: u32,
}

pub struct StatsCollector {
    network_fetches: AtomicU64,
    cache_hits: AtomicU64,
    not_modified: AtomicU64,
    authoring_loads: AtomicU64,
    fallback_loads: AtomicU64,
    failures: AtomicU64,
    downloaded_bytes: AtomicU64,
    active_transfers: AtomicU32,
    peak_transfers: AtomicU32,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            network_fetches: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            not_modified: AtomicU64::new(0),
            authoring_loads: AtomicU64::new(0),
            fallback_loads: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            downloaded_bytes: AtomicU64::new(0),
            active_transfers: AtomicU32::new(0),
            peak_transfers: AtomicU32::new(0),
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_not_modified(&self) {
        self.not_modified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_authoring_load(&self) {
        self.authoring_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallback_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a network request as in flight until the guard drops.
    pub fn begin_transfer(&self) -> TransferGuard<'_> {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
        let active = self.active_transfers.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_transfers.fetch_max(active, Ordering::SeqCst);
        TransferGuard { stats: self }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            not_modified: self.not_modified.load(Ordering::Relaxed),
            authoring_loads: self.authoring_loads.load(Ordering::Relaxed),
            fallback_loads: self.fallback_loads.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            active_transfers: self.active_transfers.load(Ordering::SeqCst),
            peak_transfers: self.peak_transfers.load(Ordering::SeqCst),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TransferGuard<'a> {
    stats: &'a StatsCollector,
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        self.stats.active_transfers.fetch_sub(1, Ordering::SeqCst);
    }
}
