//! Tiered Cache - L1 Memory + L2 Distributed + Backplane
//!
//! Per-key lookup state machine:
//!
//! ```text
//!   L1_LOOKUP ──hit──▶ return (maybe schedule eager refresh)
//!       │miss
//!       ▼                       (one leader per key, followers await it)
//!   L2_LOOKUP ──hit──▶ populate L1, return
//!       │miss
//!       ▼
//!    COMPUTE ──ok──▶ write L1 (+L2), publish eviction, return
//!       │err
//!       ▼
//!  FAILSAFE_CHECK ──stale available──▶ return stale (logged, counted)
//!       │none
//!       ▼
//!    propagate
//! ```
//!
//! Writes publish eviction messages on the backplane so peer instances drop
//! their L1 copy; received messages only ever touch the local L1.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backplane::{Backplane, BackplaneAction, BackplaneMessage, BackplaneSubscription};
use super::distributed::DistributedCache;
use super::entry::{duration_millis, now_millis, CacheEntry};
use super::key::{KeyNormalizer, NormalizedKey};
use super::memory::MemoryStore;
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::policy::EntryOptionsPolicy;
use super::serializer::{Decoded, EnvelopeSerializer};
use super::stampede::{Flight, FlightGuard, StampedeCoordinator};
use crate::config::{CacheOptions, EntryOptions};
use crate::error::{BoxError, CacheError, Result};
use crate::tenant::{CacheContext, MultiTenancyConfig, TenantContext};

/// Shortest duration derived from an absolute expiration
pub const MIN_ABSOLUTE_DURATION: Duration = Duration::from_secs(1);

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`TieredCache`]. Configurators registered on the manager
/// receive a `&mut CacheBuilder` before the cache is built.
pub struct CacheBuilder {
    name: String,
    options: CacheOptions,
    multi_tenancy: MultiTenancyConfig,
    entry_options: EntryOptions,
    default_sliding_expire_time: Duration,
    distributed: Option<Arc<dyn DistributedCache>>,
    backplane: Option<Arc<dyn Backplane>>,
    instance_id: Option<String>,
}

impl CacheBuilder {
    pub fn new(name: impl Into<String>, options: CacheOptions) -> Self {
        Self {
            name: name.into(),
            entry_options: options.default_entry_options(),
            default_sliding_expire_time: options.default_duration,
            options,
            multi_tenancy: MultiTenancyConfig::default(),
            distributed: None,
            backplane: None,
            instance_id: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Base entry template, before tenant derivation
    pub fn entry_options_mut(&mut self) -> &mut EntryOptions {
        &mut self.entry_options
    }

    pub fn set_default_sliding_expire_time(&mut self, duration: Duration) -> &mut Self {
        self.default_sliding_expire_time = duration;
        self
    }

    pub fn set_multi_tenancy(&mut self, config: MultiTenancyConfig) -> &mut Self {
        self.multi_tenancy = config;
        self
    }

    pub fn set_distributed(&mut self, cache: Arc<dyn DistributedCache>) -> &mut Self {
        self.distributed = Some(cache);
        self
    }

    pub fn set_backplane(&mut self, backplane: Arc<dyn Backplane>) -> &mut Self {
        self.backplane = Some(backplane);
        self
    }

    /// Identity used to recognise our own backplane messages
    pub fn set_instance_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn with_entry_options(mut self, entry_options: EntryOptions) -> Self {
        self.entry_options = entry_options;
        self
    }

    pub fn with_multi_tenancy(mut self, config: MultiTenancyConfig) -> Self {
        self.multi_tenancy = config;
        self
    }

    pub fn with_distributed(mut self, cache: Arc<dyn DistributedCache>) -> Self {
        self.distributed = Some(cache);
        self
    }

    pub fn with_backplane(mut self, backplane: Arc<dyn Backplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Build the cache and, when a backplane is attached, subscribe to its
    /// channel before returning.
    pub async fn build(self) -> Result<TieredCache> {
        if self.name.is_empty() {
            return Err(CacheError::invalid_argument("name", "cache name cannot be empty"));
        }
        self.options.validate()?;

        let memory = self
            .options
            .enable_memory_cache
            .then(|| MemoryStore::new(self.options.memory_capacity));
        let channel = self.options.backplane_channel(&self.name);
        let inner = Arc::new(Inner {
            instance_id: self
                .instance_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            normalizer: KeyNormalizer::new(&self.options, self.multi_tenancy),
            policy: EntryOptionsPolicy::new(&self.options, self.multi_tenancy),
            serializer: EnvelopeSerializer::new(),
            base_options: self.entry_options,
            default_sliding_expire_time: self.default_sliding_expire_time,
            stampede_protection: self.options.enable_stampede_protection,
            memory,
            distributed: self.distributed,
            backplane: self.backplane,
            channel,
            stampede: StampedeCoordinator::new(),
            metrics: Arc::new(CacheMetrics::new()),
            shutdown: CancellationToken::new(),
            name: self.name,
        });

        let subscriber = match &inner.backplane {
            Some(backplane) => {
                let subscription = backplane.subscribe(&inner.channel).await?;
                Some(tokio::spawn(run_subscriber(
                    Arc::downgrade(&inner),
                    subscription,
                    inner.shutdown.clone(),
                )))
            }
            None => None,
        };

        info!(
            cache = %inner.name,
            instance = %inner.instance_id,
            memory = inner.memory.is_some(),
            distributed = inner.distributed.is_some(),
            backplane = inner.backplane.is_some(),
            "Tiered cache created"
        );

        Ok(TieredCache {
            inner,
            subscriber: Mutex::new(subscriber),
        })
    }
}

// =============================================================================
// Tiered cache
// =============================================================================

/// Named multi-tier cache
pub struct TieredCache {
    inner: Arc<Inner>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    name: String,
    instance_id: String,
    normalizer: KeyNormalizer,
    policy: EntryOptionsPolicy,
    serializer: EnvelopeSerializer,
    base_options: EntryOptions,
    default_sliding_expire_time: Duration,
    stampede_protection: bool,
    memory: Option<MemoryStore>,
    distributed: Option<Arc<dyn DistributedCache>>,
    backplane: Option<Arc<dyn Backplane>>,
    channel: String,
    stampede: StampedeCoordinator,
    metrics: Arc<CacheMetrics>,
    shutdown: CancellationToken,
}

impl TieredCache {
    pub fn builder(name: impl Into<String>, options: CacheOptions) -> CacheBuilder {
        CacheBuilder::new(name, options)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Backplane channel this cache publishes on
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn default_sliding_expire_time(&self) -> Duration {
        self.inner.default_sliding_expire_time
    }

    /// Normalized form of `key` for `ctx`
    pub fn normalize_key(&self, key: &str, ctx: &CacheContext) -> Result<NormalizedKey> {
        self.inner.normalizer.normalize(key, &ctx.tenant)
    }

    /// Effective options for `key` under `ctx`, optionally replacing the base
    pub fn entry_options_for(
        &self,
        key: &str,
        ctx: &CacheContext,
        base: Option<EntryOptions>,
    ) -> Result<EntryOptions> {
        let key = self.normalize_key(key, ctx)?;
        Ok(self
            .inner
            .derive(&key, &ctx.tenant, base.unwrap_or(self.inner.base_options)))
    }

    /// Return the cached value for `key`, computing it with `factory` on a
    /// miss. Concurrent callers for the same key share one factory run.
    #[instrument(skip(self, ctx, factory, options), fields(cache = %self.inner.name, tenant = %ctx.tenant))]
    pub async fn get_or_compute<T, F, Fut, E>(
        &self,
        key: &str,
        ctx: &CacheContext,
        factory: F,
        options: Option<EntryOptions>,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let inner = &self.inner;
        let key = inner.normalizer.normalize(key, &ctx.tenant)?;
        let options = inner.derive(&key, &ctx.tenant, options.unwrap_or(inner.base_options));
        let now = now_millis();

        let mut stale = None;
        if let Some(entry) = inner.l1_get(&key, now) {
            if entry.is_expired(now) {
                stale = inner.stale_candidate::<T>(&key, entry);
            } else if let Some(value) = inner.decode_hit::<T>(&key, &entry.value)? {
                inner.metrics.record_l1_hit();
                if entry.needs_eager_refresh(now) {
                    inner.spawn_eager_refresh(key, ctx.tenant, factory, options);
                }
                return Ok(value);
            }
        }
        inner.metrics.record_l1_miss();

        if !inner.stampede_protection {
            let bytes = inner.resolve_miss::<T, _, _, _>(&key, ctx, factory, options, stale).await?;
            return inner.serializer.deserialize(&bytes);
        }

        match inner.stampede.join(key.as_str()) {
            Flight::Leader(guard) => {
                let outcome = inner
                    .resolve_miss::<T, _, _, _>(&key, ctx, factory, options, stale)
                    .await;
                guard.complete(outcome.clone());
                inner.serializer.deserialize(&outcome?)
            }
            Flight::Follower(waiter) => {
                inner.metrics.record_coalesced_wait();
                debug!(key = %key, "Awaiting in-flight computation");
                let outcome = ctx.guard("get_or_compute", waiter.wait()).await;
                let bytes = match outcome {
                    Ok(bytes) => bytes,
                    Err(e) => inner.fail_safe(&key, &options, e, stale)?,
                };
                inner.serializer.deserialize(&bytes)
            }
        }
    }

    /// Cached value for `key` without computing. A known-absent marker reads
    /// as `None`.
    #[instrument(skip(self, ctx), fields(cache = %self.inner.name, tenant = %ctx.tenant))]
    pub async fn try_get<T>(&self, key: &str, ctx: &CacheContext) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let inner = &self.inner;
        let key = inner.normalizer.normalize(key, &ctx.tenant)?;
        let now = now_millis();

        if let Some(entry) = inner.l1_get(&key, now).filter(|e| !e.is_expired(now)) {
            match inner.serializer.decode::<T>(&entry.value)? {
                Decoded::Value(value) => {
                    inner.metrics.record_l1_hit();
                    return Ok(Some(value));
                }
                Decoded::Absent => {
                    inner.metrics.record_l1_hit();
                    return Ok(None);
                }
                Decoded::Foreign { type_name } => {
                    debug!(key = %key, stored = %type_name, "L1 entry has a foreign type tag");
                }
            }
        }
        inner.metrics.record_l1_miss();

        match inner.l2_get(&key, ctx).await? {
            Some(entry) if !entry.is_expired(now) => match inner.serializer.decode::<T>(&entry.value)? {
                Decoded::Value(value) => {
                    inner.metrics.record_l2_hit();
                    inner.l1_set(&key, entry);
                    Ok(Some(value))
                }
                Decoded::Absent => {
                    inner.metrics.record_l2_hit();
                    inner.l1_set(&key, entry);
                    Ok(None)
                }
                Decoded::Foreign { type_name } => {
                    inner.metrics.record_l2_miss();
                    debug!(key = %key, stored = %type_name, "L2 entry has a foreign type tag");
                    Ok(None)
                }
            },
            _ => {
                if inner.distributed.is_some() {
                    inner.metrics.record_l2_miss();
                }
                Ok(None)
            }
        }
    }

    /// Cached value for `key`, or `T::default()` when absent
    pub async fn get_or_default<T>(&self, key: &str, ctx: &CacheContext) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        Ok(self.try_get(key, ctx).await?.unwrap_or_default())
    }

    /// Store `value`. `sliding` wins over `absolute`; an absolute expiry in
    /// the past or within a second still lives one second.
    #[instrument(skip(self, ctx, value), fields(cache = %self.inner.name, tenant = %ctx.tenant))]
    pub async fn set<T>(
        &self,
        key: &str,
        ctx: &CacheContext,
        value: &T,
        sliding: Option<Duration>,
        absolute: Option<DateTime<Utc>>,
    ) -> Result<()>
    where
        T: Serialize,
    {
        let bytes = self.inner.serializer.serialize(value)?;
        self.write(key, ctx, bytes, sliding, absolute).await
    }

    /// Store a known-absent marker for `T`
    #[instrument(skip(self, ctx), fields(cache = %self.inner.name, tenant = %ctx.tenant))]
    pub async fn set_absent<T>(
        &self,
        key: &str,
        ctx: &CacheContext,
        sliding: Option<Duration>,
        absolute: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let bytes = self.inner.serializer.serialize_absent::<T>()?;
        self.write(key, ctx, bytes, sliding, absolute).await
    }

    async fn write(
        &self,
        key: &str,
        ctx: &CacheContext,
        bytes: Bytes,
        sliding: Option<Duration>,
        absolute: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let inner = &self.inner;
        let key = inner.normalizer.normalize(key, &ctx.tenant)?;
        let duration = effective_duration(
            sliding,
            absolute,
            Utc::now(),
            inner.default_sliding_expire_time,
        );
        let options = inner.derive(&key, &ctx.tenant, inner.base_options.with_duration(duration));
        let entry = inner.new_entry(bytes, &options);

        inner.l1_set(&key, entry.clone());
        inner.l2_set(&key, &entry, ctx).await?;
        inner.publish(BackplaneAction::Evict {
            key: key.into_string(),
        });
        Ok(())
    }

    /// Remove `key` from every tier and tell peers to drop it
    #[instrument(skip(self, ctx), fields(cache = %self.inner.name, tenant = %ctx.tenant))]
    pub async fn remove(&self, key: &str, ctx: &CacheContext) -> Result<()> {
        let inner = &self.inner;
        let key = inner.normalizer.normalize(key, &ctx.tenant)?;

        if let Some(memory) = &inner.memory {
            memory.remove(key.as_str());
        }
        if let Some(distributed) = &inner.distributed {
            match ctx.guard("l2 remove", distributed.remove(key.as_str())).await {
                Ok(()) => {}
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    inner.metrics.record_l2_error();
                    warn!(cache = %inner.name, key = %key, error = %e, "L2 remove failed");
                }
            }
        }
        inner.publish(BackplaneAction::Evict {
            key: key.into_string(),
        });
        Ok(())
    }

    /// Remove every entry of this cache. Fails without touching anything if
    /// the distributed tier cannot clear. The L2 round trip honours the
    /// context's cancellation and deadline; L1 is only cleared after it.
    #[instrument(skip(self, ctx), fields(cache = %self.inner.name))]
    pub async fn clear(&self, ctx: &CacheContext) -> Result<()> {
        let inner = &self.inner;
        if let Some(distributed) = &inner.distributed {
            if !distributed.supports_clear() {
                return Err(CacheError::unsupported(
                    "clear",
                    format!(
                        "distributed tier of cache '{}' cannot be cleared",
                        inner.name
                    ),
                ));
            }
            ctx.guard("l2 clear", distributed.clear()).await?;
        }

        if let Some(memory) = &inner.memory {
            memory.clear();
        }
        inner.publish(BackplaneAction::Clear);
        info!(cache = %inner.name, "Cache cleared");
        Ok(())
    }

    /// Evict every L1 entry of the context's tenant, here and on peers.
    /// Returns the number of local entries dropped.
    #[instrument(skip(self, ctx), fields(cache = %self.inner.name, tenant = %ctx.tenant))]
    pub fn remove_tenant(&self, ctx: &CacheContext) -> Result<usize> {
        let inner = &self.inner;
        let segment = inner.normalizer.tenant_segment(&ctx.tenant).ok_or_else(|| {
            CacheError::unsupported("remove_tenant", "multi-tenancy is disabled")
        })?;

        let removed = inner
            .memory
            .as_ref()
            .map_or(0, |memory| memory.remove_prefix(&segment));
        debug!(segment = %segment, removed, "Tenant entries evicted");
        inner.publish(BackplaneAction::EvictPrefix { prefix: segment });
        Ok(removed)
    }

    /// Snapshot of this cache's counters
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.inner.metrics.snapshot();
        if let Some(memory) = &self.inner.memory {
            snapshot.l1_entries = memory.len() as u64;
            snapshot.l1_evictions = memory.evictions();
        }
        snapshot
    }

    /// Stop the backplane subscriber. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.subscriber.lock().take() {
            handle.abort();
            debug!(cache = %self.inner.name, "Backplane subscriber stopped");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Drop for TieredCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("name", &self.inner.name)
            .field("instance_id", &self.inner.instance_id)
            .finish()
    }
}

// =============================================================================
// Internals
// =============================================================================

impl Inner {
    fn derive(&self, key: &NormalizedKey, tenant: &TenantContext, base: EntryOptions) -> EntryOptions {
        self.policy.derive(&base, key, tenant)
    }

    fn new_entry(&self, value: Bytes, options: &EntryOptions) -> CacheEntry {
        CacheEntry::new(value, options, jitter(options.jitter_max_duration), now_millis())
    }

    fn l1_get(&self, key: &NormalizedKey, now: u64) -> Option<CacheEntry> {
        self.memory.as_ref()?.get(key.as_str(), now)
    }

    fn l1_set(&self, key: &NormalizedKey, entry: CacheEntry) {
        if let Some(memory) = &self.memory {
            memory.set(key.as_str(), entry);
        }
    }

    /// L2 read. Transport failures are logged and read as a miss; caller
    /// cancellation propagates.
    async fn l2_get(&self, key: &NormalizedKey, ctx: &CacheContext) -> Result<Option<CacheEntry>> {
        let Some(distributed) = &self.distributed else {
            return Ok(None);
        };

        let tracker = LatencyTracker::start();
        let result = ctx.guard("l2 get", distributed.get(key.as_str())).await;
        self.metrics.record_l2_read_latency(tracker.elapsed());
        match result {
            Ok(Some(bytes)) => CacheEntry::from_bytes(bytes).map(Some),
            Ok(None) => Ok(None),
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                self.metrics.record_l2_error();
                warn!(cache = %self.name, key = %key, error = %e, "L2 read failed, treating as miss");
                Ok(None)
            }
        }
    }

    /// L2 write. Transport failures are logged; caller cancellation propagates.
    async fn l2_set(&self, key: &NormalizedKey, entry: &CacheEntry, ctx: &CacheContext) -> Result<()> {
        let Some(distributed) = &self.distributed else {
            return Ok(());
        };

        let frame = entry.to_bytes()?;
        let ttl = entry.physical_ttl(now_millis());
        match ctx.guard("l2 set", distributed.set(key.as_str(), frame, ttl)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                self.metrics.record_l2_error();
                warn!(cache = %self.name, key = %key, error = %e, "L2 write failed");
                Ok(())
            }
        }
    }

    /// Usable value for a computing read. An absent marker for a type that
    /// cannot hold absence, or an entry under a foreign tag, reads as a miss.
    fn decode_hit<T: DeserializeOwned>(
        &self,
        key: &NormalizedKey,
        bytes: &[u8],
    ) -> Result<Option<T>> {
        Ok(match self.serializer.decode::<T>(bytes)? {
            Decoded::Value(value) => Some(value),
            Decoded::Absent => self.serializer.absent_value::<T>(),
            Decoded::Foreign { type_name } => {
                debug!(
                    cache = %self.name,
                    key = %key,
                    stored = %type_name,
                    "Ignoring entry with a foreign type tag"
                );
                None
            }
        })
    }

    /// Expired entry kept for fail-safe, only if it decodes as `T`
    fn stale_candidate<T: DeserializeOwned>(
        &self,
        key: &NormalizedKey,
        entry: CacheEntry,
    ) -> Option<CacheEntry> {
        matches!(self.decode_hit::<T>(key, &entry.value), Ok(Some(_))).then_some(entry)
    }

    /// L2 lookup then factory, with fail-safe on failure. Returns the
    /// envelope handed to every waiter.
    async fn resolve_miss<T, F, Fut, E>(
        &self,
        key: &NormalizedKey,
        ctx: &CacheContext,
        factory: F,
        options: EntryOptions,
        mut stale: Option<CacheEntry>,
    ) -> Result<Bytes>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let now = now_millis();

        // A leader that finished just before we joined may have filled L1
        if let Some(entry) = self.l1_get(key, now) {
            if !entry.is_expired(now) {
                if self.decode_hit::<T>(key, &entry.value)?.is_some() {
                    return Ok(entry.value);
                }
            } else {
                stale = newest(stale, self.stale_candidate::<T>(key, entry));
            }
        }

        match self.l2_get(key, ctx).await {
            Ok(Some(entry)) if !entry.is_expired(now) => {
                if self.decode_hit::<T>(key, &entry.value)?.is_some() {
                    self.metrics.record_l2_hit();
                    let value = entry.value.clone();
                    self.l1_set(key, entry);
                    return Ok(value);
                }
                self.metrics.record_l2_miss();
            }
            Ok(Some(entry)) => {
                self.metrics.record_l2_miss();
                stale = newest(stale, self.stale_candidate::<T>(key, entry));
            }
            Ok(None) => {
                if self.distributed.is_some() {
                    self.metrics.record_l2_miss();
                }
            }
            Err(e) if e.is_cancellation() => return self.fail_safe(key, &options, e, stale),
            Err(e) => return Err(e),
        }

        self.metrics.record_factory_call();
        let tracker = LatencyTracker::start();
        let computed = ctx
            .guard("factory", async move { factory().await.map_err(CacheError::upstream) })
            .await;
        self.metrics.record_factory_latency(tracker.elapsed());

        match computed {
            Ok(value) => {
                let bytes = self.serializer.serialize(&value)?;
                let entry = self.new_entry(bytes.clone(), &options);
                self.l1_set(key, entry.clone());
                if let Err(e) = self.l2_set(key, &entry, ctx).await {
                    debug!(key = %key, error = %e, "L2 write abandoned after compute");
                }
                self.publish(BackplaneAction::Evict {
                    key: key.as_str().to_string(),
                });
                Ok(bytes)
            }
            Err(e) => {
                self.metrics.record_factory_failure();
                self.fail_safe(key, &options, e, stale)
            }
        }
    }

    /// Serve `stale` in place of a recoverable failure, or propagate it
    fn fail_safe(
        &self,
        key: &NormalizedKey,
        options: &EntryOptions,
        error: CacheError,
        stale: Option<CacheEntry>,
    ) -> Result<Bytes> {
        if options.fail_safe_enabled && error.is_recoverable_by_fail_safe() {
            let now = now_millis();
            if let Some(entry) = stale.filter(|e| e.is_stale_usable(now)) {
                self.metrics.record_stale_served();
                warn!(
                    cache = %self.name,
                    key = %key,
                    error = %error,
                    expired_ms_ago = now.saturating_sub(entry.expires_at),
                    "Serving stale value (fail-safe)"
                );
                return Ok(entry.value);
            }
        }
        Err(error)
    }

    /// Refresh in the background; skipped if the key is already being computed
    fn spawn_eager_refresh<T, F, Fut, E>(
        self: &Arc<Self>,
        key: NormalizedKey,
        tenant: TenantContext,
        factory: F,
        options: EntryOptions,
    ) where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let Some(guard) = self.stampede.try_lead(key.as_str()) else {
            return;
        };
        self.metrics.record_eager_refresh();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let ctx = CacheContext::new(tenant);
            inner.run_refresh(key, &ctx, guard, factory, options).await;
        });
    }

    async fn run_refresh<T, F, Fut, E>(
        &self,
        key: NormalizedKey,
        ctx: &CacheContext,
        guard: FlightGuard,
        factory: F,
        options: EntryOptions,
    ) where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        debug!(cache = %self.name, key = %key, "Eager refresh started");
        self.metrics.record_factory_call();
        let outcome = match factory().await {
            Ok(value) => match self.serializer.serialize(&value) {
                Ok(bytes) => {
                    let entry = self.new_entry(bytes.clone(), &options);
                    self.l1_set(&key, entry.clone());
                    if let Err(e) = self.l2_set(&key, &entry, ctx).await {
                        debug!(key = %key, error = %e, "L2 write abandoned after refresh");
                    }
                    self.publish(BackplaneAction::Evict {
                        key: key.as_str().to_string(),
                    });
                    Ok(bytes)
                }
                Err(e) => Err(e),
            },
            Err(e) => {
                self.metrics.record_factory_failure();
                Err(CacheError::upstream(e))
            }
        };
        if let Err(e) = &outcome {
            warn!(cache = %self.name, key = %key, error = %e, "Eager refresh failed, keeping current value");
        }
        guard.complete(outcome);
    }

    /// Fire-and-forget publish; failures are logged and counted
    fn publish(&self, action: BackplaneAction) {
        let Some(backplane) = self.backplane.clone() else {
            return;
        };
        let message = BackplaneMessage {
            source_id: self.instance_id.clone(),
            action,
        };
        let channel = self.channel.clone();
        let name = self.name.clone();
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            match backplane.publish(&channel, &message).await {
                Ok(()) => metrics.record_backplane_published(),
                Err(e) => {
                    metrics.record_backplane_publish_failure();
                    warn!(cache = %name, channel = %channel, error = %e, "Backplane publish failed");
                }
            }
        });
    }

    fn apply_backplane(&self, message: BackplaneMessage) {
        if message.source_id == self.instance_id {
            return;
        }
        self.metrics.record_backplane_received();
        let Some(memory) = &self.memory else {
            return;
        };
        match message.action {
            BackplaneAction::Evict { key } => {
                memory.remove(&key);
                debug!(cache = %self.name, key = %key, from = %message.source_id, "Evicted by backplane");
            }
            BackplaneAction::EvictPrefix { prefix } => {
                let removed = memory.remove_prefix(&prefix);
                debug!(cache = %self.name, prefix = %prefix, removed, "Prefix evicted by backplane");
            }
            BackplaneAction::Clear => {
                memory.clear();
                debug!(cache = %self.name, from = %message.source_id, "Cleared by backplane");
            }
        }
    }
}

async fn run_subscriber(
    inner: Weak<Inner>,
    mut subscription: Box<dyn BackplaneSubscription>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = subscription.next_message() => message,
        };
        let Some(message) = message else {
            break;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply_backplane(message);
    }
}

/// Sliding wins; else time left until `absolute` (at least one second);
/// else the cache default.
pub fn effective_duration(
    sliding: Option<Duration>,
    absolute: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    default: Duration,
) -> Duration {
    if let Some(sliding) = sliding {
        return sliding;
    }
    if let Some(absolute) = absolute {
        let remaining = (absolute - now).to_std().unwrap_or(Duration::ZERO);
        return remaining.max(MIN_ABSOLUTE_DURATION);
    }
    default
}

fn jitter(max: Duration) -> Duration {
    let max_ms = duration_millis(max);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

fn newest(a: Option<CacheEntry>, b: Option<CacheEntry>) -> Option<CacheEntry> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.expires_at > a.expires_at { b } else { a }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backplane::InMemoryBackplane;
    use crate::cache::distributed::InMemoryDistributedStore;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options() -> CacheOptions {
        CacheOptions::default().with_key_prefix("MyApp")
    }

    async fn cache(options: CacheOptions) -> TieredCache {
        TieredCache::builder("Products", options).build().await.unwrap()
    }

    #[tokio::test]
    async fn test_get_or_compute_caches_value() {
        let cache = cache(options()).await;
        let ctx = CacheContext::for_tenant(1);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value: String = cache
                .get_or_compute(
                    "k",
                    &ctx,
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, CacheError>("computed".to_string())
                    },
                    None,
                )
                .await
                .unwrap();
            assert_eq!(value, "computed");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().l1_hits, 2);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let cache = cache(options()).await;
        cache
            .set("k", &CacheContext::for_tenant(1), &1u32, None, None)
            .await
            .unwrap();
        cache
            .set("k", &CacheContext::for_tenant(2), &2u32, None, None)
            .await
            .unwrap();

        assert_eq!(cache.try_get::<u32>("k", &CacheContext::for_tenant(1)).await.unwrap(), Some(1));
        assert_eq!(cache.try_get::<u32>("k", &CacheContext::for_tenant(2)).await.unwrap(), Some(2));
        assert_eq!(cache.try_get::<u32>("k", &CacheContext::host()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_absent_and_get_or_default() {
        let cache = cache(options()).await;
        let ctx = CacheContext::host();
        cache.set_absent::<Vec<u32>>("missing", &ctx, None, None).await.unwrap();
        assert_eq!(cache.try_get::<Vec<u32>>("missing", &ctx).await.unwrap(), None);
        assert_eq!(cache.get_or_default::<Vec<u32>>("missing", &ctx).await.unwrap(), Vec::<u32>::new());

        // Absent marker for a non-nullable type reads as a miss when computing
        let value: Vec<u32> = cache
            .get_or_compute("missing", &ctx, || async { Ok::<_, CacheError>(vec![1]) }, None)
            .await
            .unwrap();
        assert_eq!(value, vec![1]);
    }

    #[tokio::test]
    async fn test_option_values_cache_negative_results() {
        let cache = cache(options()).await;
        let ctx = CacheContext::host();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            let value: Option<u32> = cache
                .get_or_compute(
                    "nothing",
                    &ctx,
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, CacheError>(None)
                    },
                    None,
                )
                .await
                .unwrap();
            assert_eq!(value, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_and_empty_key() {
        let cache = cache(options()).await;
        let ctx = CacheContext::host();
        cache.set("k", &ctx, &"v".to_string(), None, None).await.unwrap();
        cache.remove("k", &ctx).await.unwrap();
        assert_eq!(cache.try_get::<String>("k", &ctx).await.unwrap(), None);
        cache.remove("k", &ctx).await.unwrap();

        assert_matches!(
            cache.set("", &ctx, &"v".to_string(), None, None).await,
            Err(CacheError::InvalidArgument { .. })
        );
    }

    #[tokio::test]
    async fn test_factory_error_without_stale_propagates() {
        let cache = cache(options()).await;
        let result: Result<u32> = cache
            .get_or_compute(
                "k",
                &CacheContext::host(),
                || async { Err::<u32, _>(std::io::Error::new(std::io::ErrorKind::Other, "db down")) },
                None,
            )
            .await;
        assert_matches!(result, Err(CacheError::Upstream { .. }));
        assert_eq!(cache.metrics().factory_failures, 1);
    }

    #[tokio::test]
    async fn test_fail_safe_serves_stale() {
        let cache = cache(options().with_multi_tenancy(false)).await;
        let ctx = CacheContext::host();
        let short = EntryOptions::new(Duration::from_millis(20))
            .with_fail_safe_max(true, Duration::from_secs(60));

        let first: u32 = cache
            .get_or_compute("k", &ctx, || async { Ok::<_, CacheError>(7) }, Some(short))
            .await
            .unwrap();
        assert_eq!(first, 7);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second: u32 = cache
            .get_or_compute(
                "k",
                &ctx,
                || async { Err::<u32, _>(CacheError::upstream_msg("db down")) },
                Some(short),
            )
            .await
            .unwrap();
        assert_eq!(second, 7);
        assert_eq!(cache.metrics().stale_served, 1);
    }

    #[tokio::test]
    async fn test_clear_unsupported_by_l2() {
        struct NoClear;
        #[async_trait::async_trait]
        impl DistributedCache for NoClear {
            async fn get(&self, _: &str) -> Result<Option<Bytes>> {
                Ok(None)
            }
            async fn set(&self, _: &str, _: Bytes, _: Duration) -> Result<()> {
                Ok(())
            }
            async fn remove(&self, _: &str) -> Result<()> {
                Ok(())
            }
        }

        let cache = TieredCache::builder("c", options())
            .with_distributed(Arc::new(NoClear))
            .build()
            .await
            .unwrap();
        let ctx = CacheContext::host();
        cache.set("k", &ctx, &1u8, None, None).await.unwrap();
        assert_matches!(cache.clear(&ctx).await, Err(CacheError::UnsupportedOperation { .. }));
        // Nothing was cleared
        assert_eq!(cache.try_get::<u8>("k", &ctx).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_clear_with_l2() {
        let store = InMemoryDistributedStore::new();
        let cache = TieredCache::builder("c", options())
            .with_distributed(Arc::new(store.partition("c")))
            .build()
            .await
            .unwrap();
        let ctx = CacheContext::host();
        cache.set("k", &ctx, &1u8, None, None).await.unwrap();
        cache.clear(&ctx).await.unwrap();
        assert_eq!(cache.try_get::<u8>("k", &ctx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_honours_cancellation() {
        let store = InMemoryDistributedStore::new();
        let cache = TieredCache::builder("c", options())
            .with_distributed(Arc::new(store.partition("c")))
            .build()
            .await
            .unwrap();
        let ctx = CacheContext::host();
        cache.set("k", &ctx, &1u8, None, None).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let cancelled = CacheContext::host().with_cancellation(token);
        assert_matches!(cache.clear(&cancelled).await, Err(CacheError::Cancelled { .. }));
        assert_eq!(cache.try_get::<u8>("k", &ctx).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_l2_hit_populates_l1() {
        let store = InMemoryDistributedStore::new();
        let writer = TieredCache::builder("c", options())
            .with_distributed(Arc::new(store.partition("c")))
            .build()
            .await
            .unwrap();
        let reader = TieredCache::builder("c", options())
            .with_distributed(Arc::new(store.partition("c")))
            .build()
            .await
            .unwrap();
        let ctx = CacheContext::for_tenant(5);
        writer.set("k", &ctx, &"shared".to_string(), None, None).await.unwrap();

        let value: String = reader
            .get_or_compute("k", &ctx, || async { Ok::<_, CacheError>("fresh".to_string()) }, None)
            .await
            .unwrap();
        assert_eq!(value, "shared");
        assert_eq!(reader.metrics().l2_hits, 1);
        assert_eq!(reader.metrics().l1_entries, 1);
    }

    #[tokio::test]
    async fn test_l2_outage_falls_through_to_factory() {
        let store = InMemoryDistributedStore::new();
        let cache = TieredCache::builder("c", options())
            .with_distributed(Arc::new(store.partition("c")))
            .build()
            .await
            .unwrap();
        store.set_online(false);
        let value: u32 = cache
            .get_or_compute("k", &CacheContext::host(), || async { Ok::<_, CacheError>(3) }, None)
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert!(cache.metrics().l2_errors >= 1);
    }

    #[tokio::test]
    async fn test_backplane_ignores_own_messages() {
        let hub = InMemoryBackplane::new();
        let cache = TieredCache::builder("c", options().with_backplane("InMemory"))
            .with_backplane(Arc::new(hub.clone()))
            .build()
            .await
            .unwrap();
        let ctx = CacheContext::host();
        cache.set("k", &ctx, &1u8, None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hub.published(), 1);
        assert_eq!(cache.try_get::<u8>("k", &ctx).await.unwrap(), Some(1));
        assert_eq!(cache.metrics().backplane_received, 0);
    }

    #[tokio::test]
    async fn test_remove_tenant() {
        let cache = cache(options()).await;
        let tenant = CacheContext::for_tenant(1);
        let other = CacheContext::for_tenant(12);
        cache.set("a", &tenant, &1u8, None, None).await.unwrap();
        cache.set("b", &tenant, &2u8, None, None).await.unwrap();
        cache.set("a", &other, &3u8, None, None).await.unwrap();

        assert_eq!(cache.remove_tenant(&tenant).unwrap(), 2);
        assert_eq!(cache.try_get::<u8>("a", &tenant).await.unwrap(), None);
        assert_eq!(cache.try_get::<u8>("a", &other).await.unwrap(), Some(3));

        let flat = TieredCache::builder("flat", options().with_multi_tenancy(false))
            .build()
            .await
            .unwrap();
        assert_matches!(
            flat.remove_tenant(&tenant),
            Err(CacheError::UnsupportedOperation { .. })
        );
    }

    #[tokio::test]
    async fn test_entry_options_for_scenarios() {
        let cache = cache(options().with_default_duration(Duration::from_secs(100 * 60))).await;
        let base = EntryOptions::new(Duration::from_secs(100 * 60));
        let tenant = cache
            .entry_options_for("k", &CacheContext::for_tenant(42), Some(base))
            .unwrap();
        let host = cache
            .entry_options_for("k", &CacheContext::host(), Some(base))
            .unwrap();
        assert_eq!(tenant.duration, Duration::from_secs(75 * 60));
        assert_eq!(tenant.jitter_max_duration, Duration::from_millis(92));
        assert_eq!(host.duration, Duration::from_secs(150 * 60));
        assert_eq!(host.jitter_max_duration, Duration::from_millis(25));
    }

    #[test]
    fn test_effective_duration() {
        let now = Utc::now();
        let default = Duration::from_secs(3600);
        assert_eq!(
            effective_duration(Some(Duration::from_secs(5)), Some(now), now, default),
            Duration::from_secs(5)
        );
        assert_eq!(
            effective_duration(None, Some(now + chrono::Duration::seconds(90)), now, default),
            Duration::from_secs(90)
        );
        assert_eq!(
            effective_duration(None, Some(now - chrono::Duration::seconds(90)), now, default),
            MIN_ABSOLUTE_DURATION
        );
        assert_eq!(
            effective_duration(None, Some(now + chrono::Duration::milliseconds(300)), now, default),
            MIN_ABSOLUTE_DURATION
        );
        assert_eq!(effective_duration(None, None, now, default), default);
    }

    #[test]
    fn test_jitter_bounds() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter(Duration::from_millis(25)) <= Duration::from_millis(25));
        }
    }

    #[tokio::test]
    async fn test_unbounded_sliding_duration() {
        let store = InMemoryDistributedStore::new();
        for (options, ctx) in [
            (options(), CacheContext::host()),
            (options(), CacheContext::for_tenant(8)),
            (options().with_multi_tenancy(false), CacheContext::host()),
        ] {
            let cache = TieredCache::builder("c", options)
                .with_distributed(Arc::new(store.partition("c")))
                .build()
                .await
                .unwrap();
            cache.set("k", &ctx, &1u8, Some(Duration::MAX), None).await.unwrap();
            assert_eq!(cache.try_get::<u8>("k", &ctx).await.unwrap(), Some(1));
        }
    }

    #[tokio::test]
    async fn test_build_validates_options() {
        let mut invalid = options();
        invalid.scope_tuning.tenant_jitter_slots = 0;
        let built = TieredCache::builder("c", invalid).build().await;
        assert_matches!(built.err(), Some(CacheError::Config(_)));
    }

    #[tokio::test]
    async fn test_foreign_type_tag_in_l2_reads_as_miss() {
        let store = InMemoryDistributedStore::new();
        let partition = store.partition("c");
        let cache = TieredCache::builder("c", options())
            .with_distributed(Arc::new(store.partition("c")))
            .build()
            .await
            .unwrap();
        let ctx = CacheContext::for_tenant(4);

        // Written by a peer whose build names the type differently
        let envelope = Bytes::from_static(br#"{"type":"peer_build::Price","payload":41}"#);
        let entry = CacheEntry::new(
            envelope,
            &EntryOptions::new(Duration::from_secs(60)),
            Duration::ZERO,
            now_millis(),
        );
        let key = cache.normalize_key("price", &ctx).unwrap();
        partition
            .set(key.as_str(), entry.to_bytes().unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.try_get::<u32>("price", &ctx).await.unwrap(), None);
        let value: u32 = cache
            .get_or_compute("price", &ctx, || async { Ok::<_, CacheError>(42) }, None)
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(cache.metrics().factory_calls, 1);
        assert_eq!(cache.try_get::<u32>("price", &ctx).await.unwrap(), Some(42));
    }
}
