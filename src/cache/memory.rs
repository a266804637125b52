//! L1 Cache - In-Process Memory Store
//!
//! Synchronous, process-local tier. Lookups never suspend.
//!
//! # Design
//!
//! - `DashMap` keyed by normalized key for low lock contention
//! - Entry-count capacity with a low watermark so eviction runs in batches
//! - Eviction order: dead entries, then expired (stale) entries, then by
//!   priority (Low before Normal before High), then oldest insertion first

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use super::entry::CacheEntry;
use crate::config::{Priority, DEFAULT_MEMORY_CAPACITY};

/// L1 configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// Fraction of capacity eviction shrinks down to
    pub low_watermark: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MEMORY_CAPACITY,
            low_watermark: 0.90,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    entry: CacheEntry,
    seq: u64,
}

/// L1 memory store
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    config: MemoryConfig,
    /// Insertion sequence for age ordering
    seq: AtomicU64,
    evictions: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_config(MemoryConfig::default())
    }
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self::with_config(MemoryConfig {
            capacity,
            ..Default::default()
        })
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            seq: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Entry for `key`, fresh or stale. Entries past their fail-safe window
    /// are dropped and reported as absent.
    pub fn get(&self, key: &str, now: u64) -> Option<CacheEntry> {
        let entry = self.entries.get(key).map(|slot| slot.entry.clone())?;
        if entry.is_dead(now) {
            self.entries.remove_if(key, |_, slot| slot.entry.is_dead(now));
            return None;
        }
        Some(entry)
    }

    pub fn set(&self, key: &str, entry: CacheEntry) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key.to_string(), Slot { entry, seq });

        if self.entries.len() > self.config.capacity {
            self.evict(super::entry::now_millis());
        }
    }

    /// Remove `key`; absent keys are a no-op
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key starting with `prefix`
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Shrink to the low watermark
    fn evict(&self, now: u64) {
        let target = ((self.config.capacity as f64) * self.config.low_watermark) as usize;
        let target = target.min(self.config.capacity.saturating_sub(1));

        // (class, priority, seq): lower sorts first and is evicted first
        let mut candidates: Vec<(u8, Priority, u64, String)> = self
            .entries
            .iter()
            .map(|item| {
                let slot = item.value();
                let class = if slot.entry.is_dead(now) {
                    0
                } else if slot.entry.is_expired(now) {
                    1
                } else {
                    2
                };
                (class, slot.entry.priority, slot.seq, item.key().clone())
            })
            .collect();
        candidates.sort_unstable_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

        let mut evicted = 0u64;
        for (_, _, seq, key) in candidates {
            if self.entries.len() <= target {
                break;
            }
            // Skip keys rewritten since the snapshot
            if self.entries.remove_if(&key, |_, slot| slot.seq == seq).is_some() {
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(evicted, remaining = self.entries.len(), "L1 eviction pass");
        }
    }
}
