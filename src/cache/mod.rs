//! Multi-Tier Cache Engine
//!
//! Read-through cache with a process-local L1, an optional shared L2 and a
//! backplane that keeps peer L1s coherent.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           CacheManager                                    │
//! │                  name → TieredCache (created once)                        │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  KeyNormalizer ─▶ EntryOptionsPolicy ─▶ StampedeCoordinator              │
//! │        │                                        │                         │
//! │        ▼                                        ▼                         │
//! │  ┌──────────────┐    ┌──────────────────┐    ┌────────────────────┐      │
//! │  │ L1 Memory    │    │ L2 Distributed   │    │ Factory            │      │
//! │  │ MemoryStore  │◀──▶│ DistributedCache │◀──▶│ (caller supplied)  │      │
//! │  └──────────────┘    └──────────────────┘    └────────────────────┘      │
//! │        ▲                                                                  │
//! │        │ evict                                                            │
//! │  ┌─────┴────────────────────────────────────────────────────────────┐    │
//! │  │ Backplane: {prefix}:backplane:{cache}  (eviction signals only)   │    │
//! │  └──────────────────────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - One factory run per normalized key per process at a time
//! - Tenant keys never collide with each other or with host keys
//! - A failed refresh serves the last value while it is inside its
//!   fail-safe window

mod backplane;
mod distributed;
mod entry;
mod key;
mod manager;
mod memory;
mod metrics;
mod policy;
mod serializer;
mod stampede;
mod tiered;

pub use backplane::{
    Backplane, BackplaneAction, BackplaneMessage, BackplaneSubscription, InMemoryBackplane,
    DEFAULT_CHANNEL_CAPACITY,
};
pub use distributed::{
    DistributedCache, DistributedStats, InMemoryDistributedCache, InMemoryDistributedStore,
};
pub use entry::{now_millis, CacheEntry};
pub use key::{KeyNormalizer, NormalizedKey};
pub use manager::CacheManager;
pub use memory::{MemoryConfig, MemoryStore};
pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
pub use policy::EntryOptionsPolicy;
pub use serializer::{CachedValue, Decoded, EnvelopeSerializer};
pub use stampede::{Flight, FlightGuard, FlightWaiter, StampedeCoordinator};
pub use tiered::{effective_duration, CacheBuilder, TieredCache, MIN_ABSOLUTE_DURATION};
