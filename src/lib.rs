//! TierCache - Multi-Tier Cache with Tenant Isolation
//!
//! A read-through cache for request-driven services: a process-local memory
//! tier, an optional distributed tier shared by every instance, and a
//! backplane that evicts stale copies from peer instances.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ CacheManager ──▶ TieredCache ──▶ L1 (memory) ──▶ L2 (distributed) ──▶ factory
//!                                  │
//!                                  └──▶ Backplane ──▶ peer instances evict their L1
//! ```
//!
//! # Features
//!
//! - Tenant-scoped keys and tenant-aware expiration policy
//! - Stampede protection (one factory run per key per process)
//! - Fail-safe: serve the last value when a refresh fails
//! - Eager refresh ahead of expiry
//! - Duration jitter to spread expirations
//! - Pluggable distributed and backplane providers
//!
//! # Modules
//!
//! - [`cache`] - Tiered cache engine and cache manager
//! - [`config`] - Cache and entry options
//! - [`error`] - Error types
//! - [`providers`] - Provider registry and built-in providers
//! - [`tenant`] - Tenant and per-call context

pub mod cache;
pub mod config;
pub mod error;
pub mod providers;
pub mod tenant;

// Re-export commonly used types
pub use cache::{CacheBuilder, CacheManager, MetricsSnapshot, NormalizedKey, TieredCache};
pub use config::{CacheOptions, EntryOptions, Priority, ScopeTuning};
pub use error::{CacheError, ErrorKind, Result};
pub use providers::{ProviderRegistry, ProviderSettings};
pub use tenant::{CacheContext, MultiTenancyConfig, TenantContext, TenantProvider};
