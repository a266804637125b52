//! Providers
//!
//! Named factories for the pluggable tiers. The cache manager looks a
//! provider up by the name configured in `CacheOptions` and asks it for a
//! distributed store per named cache, or for the backplane shared by all
//! caches.
//!
//! ```text
//!   CacheOptions.distributed_provider_name ──▶ ProviderRegistry ──▶ DistributedProvider
//!                                                                      │ create_cache(name)
//!                                                                      ▼
//!                                                             Arc<dyn DistributedCache>
//! ```

use std::sync::Arc;

use crate::cache::{Backplane, DistributedCache};
use crate::config::CacheOptions;
use crate::error::Result;

mod memory;
mod null;
mod registry;
mod settings;

pub use memory::{InMemoryBackplaneProvider, InMemoryDistributedProvider, IN_MEMORY_PROVIDER};
pub use null::{NullBackplane, NullBackplaneProvider, NullDistributedCache, NullDistributedProvider, NULL_PROVIDER};
pub use registry::{BackplaneFactory, DistributedFactory, ProviderRegistry};
pub use settings::ProviderSettings;

/// Factory for L2 stores
pub trait DistributedProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the provider can be used with `settings`
    fn is_available(&self, _settings: &ProviderSettings) -> bool {
        true
    }

    /// Store for the named cache
    fn create_cache(
        &self,
        cache_name: &str,
        settings: &ProviderSettings,
        options: &CacheOptions,
    ) -> Result<Arc<dyn DistributedCache>>;
}

/// Factory for invalidation transports
pub trait BackplaneProvider: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self, _settings: &ProviderSettings) -> bool {
        true
    }

    fn create_backplane(
        &self,
        settings: &ProviderSettings,
        options: &CacheOptions,
    ) -> Result<Arc<dyn Backplane>>;
}
