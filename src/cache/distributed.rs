//! L2 Cache - Distributed Store Port
//!
//! Network-backed tier shared by every instance of a deployment. The core
//! only talks to it through [`DistributedCache`]; transports live behind
//! providers.
//!
//! [`InMemoryDistributedStore`] is a process-wide stand-in: every handle
//! obtained from the same store sees the same data, which is how several
//! simulated instances share one L2 in tests and the demo.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::entry::{duration_millis, now_millis};
use crate::error::{CacheError, Result};

/// Distributed storage backend
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Get raw bytes for `key`
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store raw bytes with a physical time to live
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Delete `key`; absent keys are not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// Whether [`clear`](Self::clear) is implemented
    fn supports_clear(&self) -> bool {
        false
    }

    /// Remove every key owned by this cache
    async fn clear(&self) -> Result<()> {
        Err(CacheError::unsupported(
            "clear",
            "distributed backend cannot enumerate its keys",
        ))
    }
}

/// Distributed store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributedStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

type Partition = DashMap<String, (Bytes, u64)>;

/// Shared in-memory L2. Clone it to hand the same store to several instances.
#[derive(Clone)]
pub struct InMemoryDistributedStore {
    /// cache name -> key -> (value, expires_at)
    partitions: Arc<DashMap<String, Arc<Partition>>>,
    online: Arc<AtomicBool>,
    reads: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
    deletes: Arc<AtomicU64>,
}

impl Default for InMemoryDistributedStore {
    fn default() -> Self {
        Self {
            partitions: Arc::new(DashMap::new()),
            online: Arc::new(AtomicBool::new(true)),
            reads: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
            deletes: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl InMemoryDistributedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle scoped to one named cache
    pub fn partition(&self, cache_name: &str) -> InMemoryDistributedCache {
        let partition = self
            .partitions
            .entry(cache_name.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .value()
            .clone();
        InMemoryDistributedCache {
            partition,
            store: self.clone(),
        }
    }

    /// Simulate an outage: every call fails with an upstream error
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DistributedStats {
        DistributedStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(CacheError::upstream_msg("in-memory distributed store is offline"))
        }
    }
}

/// One cache's view of an [`InMemoryDistributedStore`]
#[derive(Clone)]
pub struct InMemoryDistributedCache {
    partition: Arc<Partition>,
    store: InMemoryDistributedStore,
}

impl InMemoryDistributedCache {
    pub fn len(&self) -> usize {
        self.partition.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partition.is_empty()
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.store.ensure_online()?;
        self.store.reads.fetch_add(1, Ordering::Relaxed);

        let now = now_millis();
        let found = self
            .partition
            .get(key)
            .map(|item| (item.0.clone(), item.1));
        match found {
            Some((_, expires_at)) if now >= expires_at => {
                self.partition.remove_if(key, |_, v| now >= v.1);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.store.ensure_online()?;
        self.store.writes.fetch_add(1, Ordering::Relaxed);

        let expires_at = now_millis().saturating_add(duration_millis(ttl));
        self.partition.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.store.ensure_online()?;
        self.store.deletes.fetch_add(1, Ordering::Relaxed);
        self.partition.remove(key);
        Ok(())
    }

    fn supports_clear(&self) -> bool {
        true
    }

    async fn clear(&self) -> Result<()> {
        self.store.ensure_online()?;
        self.partition.clear();
        Ok(())
    }
}
