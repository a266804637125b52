//! In-process providers backed by a shared store and hub. Every cache
//! created from the same provider sees the same data and messages, so
//! several managers in one process behave like several service instances.

use std::sync::Arc;

use super::{BackplaneProvider, DistributedProvider, ProviderSettings};
use crate::cache::{Backplane, DistributedCache, InMemoryBackplane, InMemoryDistributedStore};
use crate::config::CacheOptions;
use crate::error::Result;

/// Registered name of the in-memory providers
pub const IN_MEMORY_PROVIDER: &str = "InMemory";

#[derive(Clone, Default)]
pub struct InMemoryDistributedProvider {
    store: InMemoryDistributedStore,
}

impl InMemoryDistributedProvider {
    pub fn new(store: InMemoryDistributedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &InMemoryDistributedStore {
        &self.store
    }
}

impl DistributedProvider for InMemoryDistributedProvider {
    fn name(&self) -> &str {
        IN_MEMORY_PROVIDER
    }

    fn create_cache(
        &self,
        cache_name: &str,
        _settings: &ProviderSettings,
        _options: &CacheOptions,
    ) -> Result<Arc<dyn DistributedCache>> {
        Ok(Arc::new(self.store.partition(cache_name)))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBackplaneProvider {
    hub: InMemoryBackplane,
}

impl InMemoryBackplaneProvider {
    pub fn new(hub: InMemoryBackplane) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &InMemoryBackplane {
        &self.hub
    }
}

impl BackplaneProvider for InMemoryBackplaneProvider {
    fn name(&self) -> &str {
        IN_MEMORY_PROVIDER
    }

    fn create_backplane(
        &self,
        _settings: &ProviderSettings,
        _options: &CacheOptions,
    ) -> Result<Arc<dyn Backplane>> {
        Ok(Arc::new(self.hub.clone()))
    }
}
