//! Provider Registry
//!
//! Maps a provider name to a factory closure. The distributed and backplane
//! namespaces are independent: a name registered in one never satisfies a
//! lookup in the other. Registration is insert-if-absent, so registering the
//! same name twice keeps the first factory and is not an error.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::memory::{InMemoryBackplaneProvider, InMemoryDistributedProvider, IN_MEMORY_PROVIDER};
use super::null::{NullBackplaneProvider, NullDistributedProvider, NULL_PROVIDER};
use super::{BackplaneProvider, DistributedProvider};
use crate::error::{CacheError, ProviderKind, Result};

pub type DistributedFactory = Arc<dyn Fn() -> Arc<dyn DistributedProvider> + Send + Sync>;
pub type BackplaneFactory = Arc<dyn Fn() -> Arc<dyn BackplaneProvider> + Send + Sync>;

#[derive(Default)]
pub struct ProviderRegistry {
    distributed: DashMap<String, DistributedFactory>,
    backplane: DashMap<String, BackplaneFactory>,
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `Null` and `InMemory` providers in both namespaces
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_distributed(NULL_PROVIDER, || Arc::new(NullDistributedProvider));
        registry.register_backplane(NULL_PROVIDER, || Arc::new(NullBackplaneProvider));

        let store = InMemoryDistributedProvider::default();
        registry.register_distributed(IN_MEMORY_PROVIDER, move || Arc::new(store.clone()));
        let hub = InMemoryBackplaneProvider::default();
        registry.register_backplane(IN_MEMORY_PROVIDER, move || Arc::new(hub.clone()));
        registry
    }

    /// Returns `false` when `name` was already registered
    pub fn register_distributed<F>(&self, name: impl Into<String>, factory: F) -> bool
    where
        F: Fn() -> Arc<dyn DistributedProvider> + Send + Sync + 'static,
    {
        let factory: DistributedFactory = Arc::new(factory);
        insert_if_absent(&self.distributed, name.into(), factory, ProviderKind::Distributed)
    }

    pub fn register_backplane<F>(&self, name: impl Into<String>, factory: F) -> bool
    where
        F: Fn() -> Arc<dyn BackplaneProvider> + Send + Sync + 'static,
    {
        let factory: BackplaneFactory = Arc::new(factory);
        insert_if_absent(&self.backplane, name.into(), factory, ProviderKind::Backplane)
    }

    pub fn resolve_distributed(&self, name: &str) -> Result<Arc<dyn DistributedProvider>> {
        let factory = self
            .distributed
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_registered(ProviderKind::Distributed, name))?;
        Ok(factory())
    }

    pub fn resolve_backplane(&self, name: &str) -> Result<Arc<dyn BackplaneProvider>> {
        let factory = self
            .backplane
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_registered(ProviderKind::Backplane, name))?;
        Ok(factory())
    }

    /// Registered distributed provider names, sorted
    pub fn list_distributed(&self) -> Vec<String> {
        sorted_keys(&self.distributed)
    }

    /// Registered backplane provider names, sorted
    pub fn list_backplane(&self) -> Vec<String> {
        sorted_keys(&self.backplane)
    }
}

fn insert_if_absent<V>(map: &DashMap<String, V>, name: String, value: V, kind: ProviderKind) -> bool {
    let mut inserted = false;
    map.entry(name.clone()).or_insert_with(|| {
        inserted = true;
        value
    });
    debug!(provider = %name, kind = %kind, inserted, "Provider registration");
    inserted
}

fn sorted_keys<V>(map: &DashMap<String, V>) -> Vec<String> {
    let mut names: Vec<String> = map.iter().map(|entry| entry.key().clone()).collect();
    names.sort();
    names
}

fn not_registered(kind: ProviderKind, name: &str) -> CacheError {
    CacheError::NotRegistered {
        kind,
        name: name.to_string(),
    }
}
