//! Cache Manager
//!
//! Owns the named caches of one service instance. Providers are resolved
//! once at construction; each named cache is built on first use and
//! memoized. Concurrent first access to the same name yields one instance.
//!
//! ```text
//!   get_cache("Products") ──▶ caches: name → OnceCell ──init once──▶ CacheBuilder
//!                                                                    │ + L2 partition
//!                                                                    │ + shared backplane
//!                                                                    │ + configurators
//!                                                                    ▼
//!                                                             Arc<TieredCache>
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tracing::{info, instrument};

use super::backplane::Backplane;
use super::tiered::{CacheBuilder, TieredCache};
use crate::config::CacheOptions;
use crate::error::{CacheError, ProviderKind, Result};
use crate::providers::{DistributedProvider, ProviderRegistry, ProviderSettings};
use crate::tenant::MultiTenancyConfig;

type ConfigureFn = Arc<dyn Fn(&mut CacheBuilder) + Send + Sync>;

struct Configurator {
    /// `None` applies to every cache
    cache_name: Option<String>,
    apply: ConfigureFn,
}

impl Configurator {
    fn applies_to(&self, name: &str) -> bool {
        self.cache_name.as_deref().map_or(true, |target| target == name)
    }
}

/// Registry of named caches
pub struct CacheManager {
    options: CacheOptions,
    settings: ProviderSettings,
    multi_tenancy: MultiTenancyConfig,
    registry: Arc<ProviderRegistry>,
    distributed: Option<Arc<dyn DistributedProvider>>,
    backplane: Option<Arc<dyn Backplane>>,
    configurators: RwLock<Vec<Configurator>>,
    caches: DashMap<String, Arc<OnceCell<Arc<TieredCache>>>>,
}

impl CacheManager {
    /// Validate `options` and resolve the providers it enables
    pub fn new(
        options: CacheOptions,
        registry: Arc<ProviderRegistry>,
        settings: ProviderSettings,
    ) -> Result<Self> {
        options.validate()?;

        let distributed = match enabled_provider(
            options.enable_distributed_cache,
            options.distributed_provider_name.as_deref(),
        ) {
            Some(name) => {
                let provider = registry.resolve_distributed(name)?;
                if !provider.is_available(&settings) {
                    return Err(unavailable(ProviderKind::Distributed, name));
                }
                Some(provider)
            }
            None => None,
        };

        let backplane = match enabled_provider(
            options.enable_backplane,
            options.backplane_provider_name.as_deref(),
        ) {
            Some(name) => {
                let provider = registry.resolve_backplane(name)?;
                if !provider.is_available(&settings) {
                    return Err(unavailable(ProviderKind::Backplane, name));
                }
                Some(provider.create_backplane(&settings, &options)?)
            }
            None => None,
        };

        info!(
            distributed = ?options.distributed_provider_name.as_deref().filter(|_| distributed.is_some()),
            backplane = ?options.backplane_provider_name.as_deref().filter(|_| backplane.is_some()),
            multi_tenancy = options.enable_multi_tenancy,
            "Cache manager created"
        );

        Ok(Self {
            options,
            settings,
            multi_tenancy: MultiTenancyConfig::default(),
            registry,
            distributed,
            backplane,
            configurators: RwLock::new(Vec::new()),
            caches: DashMap::new(),
        })
    }

    /// Manager with the built-in providers and no provider settings
    pub fn with_defaults(options: CacheOptions) -> Result<Self> {
        Self::new(
            options,
            Arc::new(ProviderRegistry::with_defaults()),
            ProviderSettings::default(),
        )
    }

    /// Runtime multi-tenancy switch applied to caches created afterwards
    pub fn with_multi_tenancy(mut self, config: MultiTenancyConfig) -> Self {
        self.multi_tenancy = config;
        self
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Register a hook run once when a cache is created. `None` targets
    /// every cache.
    pub fn add_configurator<F>(&self, cache_name: Option<&str>, configure: F)
    where
        F: Fn(&mut CacheBuilder) + Send + Sync + 'static,
    {
        self.configurators.write().push(Configurator {
            cache_name: cache_name.map(str::to_string),
            apply: Arc::new(configure),
        });
    }

    /// Named cache, created on first use
    #[instrument(skip(self))]
    pub async fn get_cache(&self, name: &str) -> Result<Arc<TieredCache>> {
        if name.is_empty() {
            return Err(CacheError::invalid_argument(
                "name",
                "cache name cannot be empty",
            ));
        }

        let cell = self
            .caches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        cell.get_or_try_init(|| self.create_cache(name))
            .await
            .map(Arc::clone)
    }

    async fn create_cache(&self, name: &str) -> Result<Arc<TieredCache>> {
        let mut builder =
            TieredCache::builder(name, self.options.clone()).with_multi_tenancy(self.multi_tenancy);

        if let Some(provider) = &self.distributed {
            builder.set_distributed(provider.create_cache(name, &self.settings, &self.options)?);
        }
        if let Some(backplane) = &self.backplane {
            builder.set_backplane(Arc::clone(backplane));
        }

        let hooks: Vec<ConfigureFn> = self
            .configurators
            .read()
            .iter()
            .filter(|c| c.applies_to(name))
            .map(|c| Arc::clone(&c.apply))
            .collect();
        for hook in &hooks {
            hook(&mut builder);
        }

        let cache = builder.build().await?;
        Ok(Arc::new(cache))
    }

    /// Every cache created so far, ordered by name
    pub fn get_all_caches(&self) -> Vec<Arc<TieredCache>> {
        let mut caches: Vec<Arc<TieredCache>> = self
            .caches
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        caches.sort_by(|a, b| a.name().cmp(b.name()));
        caches
    }

    /// Release every cache. Safe to call repeatedly.
    pub fn dispose(&self) {
        let caches = self.get_all_caches();
        for cache in &caches {
            cache.shutdown();
        }
        self.caches.clear();
        if !caches.is_empty() {
            info!(released = caches.len(), "Cache manager disposed");
        }
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn enabled_provider(enabled: bool, name: Option<&str>) -> Option<&str> {
    if enabled {
        name.filter(|n| !n.is_empty())
    } else {
        None
    }
}

fn unavailable(kind: ProviderKind, name: &str) -> CacheError {
    CacheError::Config(format!("{} provider '{}' is not available with the given settings", kind, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::CacheContext;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[tokio::test]
    async fn test_get_cache_is_memoized() {
        let manager = CacheManager::with_defaults(CacheOptions::default()).unwrap();
        let a = manager.get_cache("Products").await.unwrap();
        let b = manager.get_cache("Products").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "Products");
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let manager = CacheManager::with_defaults(CacheOptions::default()).unwrap();
        assert_matches!(
            manager.get_cache("").await.err(),
            Some(CacheError::InvalidArgument { argument: "name", .. })
        );
    }

    #[tokio::test]
    async fn test_concurrent_first_access_yields_one_instance() {
        let manager = Arc::new(CacheManager::with_defaults(CacheOptions::default()).unwrap());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_cache("Orders").await.unwrap() })
            })
            .collect();

        let caches = futures::future::try_join_all(handles).await.unwrap();
        assert!(caches.iter().all(|c| Arc::ptr_eq(c, &caches[0])));
        assert_eq!(manager.get_all_caches().len(), 1);
    }

    #[test]
    fn test_missing_provider_fails_construction() {
        let options = CacheOptions::default().with_distributed_cache("Redis");
        assert_matches!(
            CacheManager::with_defaults(options).err(),
            Some(CacheError::NotRegistered { kind: ProviderKind::Distributed, .. })
        );
    }

    #[tokio::test]
    async fn test_configurators_applied_once_per_cache() {
        let manager = CacheManager::with_defaults(CacheOptions::default()).unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        manager.add_configurator(None, move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        manager.add_configurator(Some("Short"), |builder| {
            builder.set_default_sliding_expire_time(Duration::from_secs(5));
        });

        let short = manager.get_cache("Short").await.unwrap();
        let _ = manager.get_cache("Short").await.unwrap();
        let other = manager.get_cache("Other").await.unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(short.default_sliding_expire_time(), Duration::from_secs(5));
        assert_eq!(other.default_sliding_expire_time(), Duration::from_secs(30 * 60));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let manager = CacheManager::with_defaults(CacheOptions::default()).unwrap();
        let cache = manager.get_cache("Products").await.unwrap();
        cache
            .set("k", &CacheContext::host(), &1u8, None, None)
            .await
            .unwrap();

        manager.dispose();
        manager.dispose();
        assert!(manager.get_all_caches().is_empty());
        assert!(cache.is_shut_down());

        let fresh = manager.get_cache("Products").await.unwrap();
        assert!(!Arc::ptr_eq(&cache, &fresh));
    }

    #[tokio::test]
    async fn test_caches_get_their_own_l2_partition() {
        let options = CacheOptions::default().with_distributed_cache("InMemory");
        let manager = CacheManager::with_defaults(options).unwrap();
        let ctx = CacheContext::host();
        let products = manager.get_cache("Products").await.unwrap();
        let orders = manager.get_cache("Orders").await.unwrap();

        products.set("k", &ctx, &1u8, None, None).await.unwrap();
        assert_eq!(orders.try_get::<u8>("k", &ctx).await.unwrap(), None);
        orders.clear(&ctx).await.unwrap();
        assert_eq!(products.try_get::<u8>("k", &ctx).await.unwrap(), Some(1));
    }
}
