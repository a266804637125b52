//! Cache Metrics Collection
//!
//! Per-cache counters for hit rates, factory activity, fail-safe absorption
//! and backplane health.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // L1 metrics
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,

    // L2 metrics
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_errors: AtomicU64,
    l2_read_latency_us: AtomicU64,

    // Compute path
    factory_calls: AtomicU64,
    factory_failures: AtomicU64,
    factory_latency_us: AtomicU64,
    coalesced_waits: AtomicU64,
    eager_refreshes: AtomicU64,

    // Fail-safe
    stale_served: AtomicU64,

    // Backplane
    backplane_published: AtomicU64,
    backplane_publish_failures: AtomicU64,
    backplane_received: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    // L1 metrics
    pub fn record_l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1_miss(&self) {
        self.l1_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn l1_hits(&self) -> u64 {
        self.l1_hits.load(Ordering::Relaxed)
    }

    pub fn l1_misses(&self) -> u64 {
        self.l1_misses.load(Ordering::Relaxed)
    }

    pub fn l1_hit_ratio(&self) -> f64 {
        ratio(self.l1_hits(), self.l1_misses())
    }

    // L2 metrics
    pub fn record_l2_hit(&self) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_miss(&self) {
        self.l2_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_error(&self) {
        self.l2_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_read_latency(&self, duration: Duration) {
        update_latency_ema(&self.l2_read_latency_us, duration);
    }

    pub fn l2_hits(&self) -> u64 {
        self.l2_hits.load(Ordering::Relaxed)
    }

    pub fn l2_misses(&self) -> u64 {
        self.l2_misses.load(Ordering::Relaxed)
    }

    // Compute path
    pub fn record_factory_call(&self) {
        self.factory_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_factory_failure(&self) {
        self.factory_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_factory_latency(&self, duration: Duration) {
        update_latency_ema(&self.factory_latency_us, duration);
    }

    pub fn record_coalesced_wait(&self) {
        self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eager_refresh(&self) {
        self.eager_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn factory_calls(&self) -> u64 {
        self.factory_calls.load(Ordering::Relaxed)
    }

    /// Fail-safe absorbed an upstream failure by serving a stale value
    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_served(&self) -> u64 {
        self.stale_served.load(Ordering::Relaxed)
    }

    // Backplane
    pub fn record_backplane_published(&self) {
        self.backplane_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backplane_publish_failure(&self) {
        self.backplane_publish_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backplane_received(&self) {
        self.backplane_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            l1_hits: self.l1_hits(),
            l1_misses: self.l1_misses(),
            l1_hit_ratio: self.l1_hit_ratio(),
            l1_entries: 0,
            l1_evictions: 0,

            l2_hits: self.l2_hits(),
            l2_misses: self.l2_misses(),
            l2_errors: self.l2_errors.load(Ordering::Relaxed),
            l2_read_latency: Duration::from_micros(self.l2_read_latency_us.load(Ordering::Relaxed)),

            factory_calls: self.factory_calls(),
            factory_failures: self.factory_failures.load(Ordering::Relaxed),
            factory_latency: Duration::from_micros(self.factory_latency_us.load(Ordering::Relaxed)),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            eager_refreshes: self.eager_refreshes.load(Ordering::Relaxed),

            stale_served: self.stale_served(),

            backplane_published: self.backplane_published.load(Ordering::Relaxed),
            backplane_publish_failures: self.backplane_publish_failures.load(Ordering::Relaxed),
            backplane_received: self.backplane_received.load(Ordering::Relaxed),
        }
    }
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;
    let alpha = 0.1; // EMA smoothing factor

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Snapshot of a cache's metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    // L1
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l1_hit_ratio: f64,
    pub l1_entries: u64,
    pub l1_evictions: u64,

    // L2
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l2_errors: u64,
    pub l2_read_latency: Duration,

    // Compute
    pub factory_calls: u64,
    pub factory_failures: u64,
    pub factory_latency: Duration,
    pub coalesced_waits: u64,
    pub eager_refreshes: u64,

    // Fail-safe
    pub stale_served: u64,

    // Backplane
    pub backplane_published: u64,
    pub backplane_publish_failures: u64,
    pub backplane_received: u64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();
        metrics.record_l1_hit();
        metrics.record_l1_hit();
        metrics.record_l1_hit();
        metrics.record_l1_miss();
        assert_eq!(metrics.l1_hits(), 3);
        assert!((metrics.l1_hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_ema() {
        let metrics = CacheMetrics::new();
        metrics.record_factory_latency(Duration::from_micros(100));
        assert_eq!(metrics.snapshot().factory_latency, Duration::from_micros(100));
        metrics.record_factory_latency(Duration::from_micros(200));
        let smoothed = metrics.snapshot().factory_latency;
        assert!(smoothed > Duration::from_micros(100) && smoothed < Duration::from_micros(200));
    }

    #[test]
    fn test_snapshot() {
        let metrics = CacheMetrics::new();
        metrics.record_factory_call();
        metrics.record_factory_failure();
        metrics.record_stale_served();
        metrics.record_backplane_publish_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.factory_calls, 1);
        assert_eq!(snapshot.factory_failures, 1);
        assert_eq!(snapshot.stale_served, 1);
        assert_eq!(snapshot.backplane_publish_failures, 1);
        assert_eq!(snapshot.l1_hit_ratio, 0.0);
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(tracker.elapsed() >= Duration::from_millis(5));
    }
}
