//! No-op providers. Useful to switch a tier on in configuration without any
//! infrastructure behind it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{BackplaneProvider, DistributedProvider, ProviderSettings};
use crate::cache::{Backplane, BackplaneMessage, BackplaneSubscription, DistributedCache};
use crate::config::CacheOptions;
use crate::error::Result;

/// Registered name of the no-op providers
pub const NULL_PROVIDER: &str = "Null";

/// L2 that stores nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDistributedCache;

#[async_trait]
impl DistributedCache for NullDistributedCache {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn supports_clear(&self) -> bool {
        true
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// Backplane that drops every message and never delivers one
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackplane;

struct NullSubscription;

#[async_trait]
impl BackplaneSubscription for NullSubscription {
    async fn next_message(&mut self) -> Option<BackplaneMessage> {
        std::future::pending().await
    }
}

#[async_trait]
impl Backplane for NullBackplane {
    async fn publish(&self, _channel: &str, _message: &BackplaneMessage) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, _channel: &str) -> Result<Box<dyn BackplaneSubscription>> {
        Ok(Box::new(NullSubscription))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullDistributedProvider;

impl DistributedProvider for NullDistributedProvider {
    fn name(&self) -> &str {
        NULL_PROVIDER
    }

    fn create_cache(
        &self,
        _cache_name: &str,
        _settings: &ProviderSettings,
        _options: &CacheOptions,
    ) -> Result<Arc<dyn DistributedCache>> {
        Ok(Arc::new(NullDistributedCache))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackplaneProvider;

impl BackplaneProvider for NullBackplaneProvider {
    fn name(&self) -> &str {
        NULL_PROVIDER
    }

    fn create_backplane(
        &self,
        _settings: &ProviderSettings,
        _options: &CacheOptions,
    ) -> Result<Arc<dyn Backplane>> {
        Ok(Arc::new(NullBackplane))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_cache_stores_nothing() {
        let cache = NullDistributedProvider
            .create_cache("c", &ProviderSettings::new(), &CacheOptions::default())
            .unwrap();
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.supports_clear());
    }

    #[tokio::test]
    async fn test_null_backplane_never_delivers() {
        let backplane = NullBackplane;
        let mut sub = backplane.subscribe("c").await.unwrap();
        backplane
            .publish("c", &BackplaneMessage::clear("a"))
            .await
            .unwrap();
        let next = tokio::time::timeout(Duration::from_millis(20), sub.next_message()).await;
        assert!(next.is_err());
    }
}
