//! Key normalization
//!
//! Builds the storage key from a raw key, the global prefix and the tenant
//! scope. The tenant segment is always outermost:
//!
//! ```text
//!   "testKey"  ──prefix──▶  "MyApp:testKey"  ──tenant──▶  "tenant:456:MyApp:testKey"
//!                                                         "tenant:host:MyApp:testKey"
//! ```
//!
//! Dropping the prefix therefore never weakens tenant isolation, and all keys
//! of one tenant share the `tenant:<id>:` segment used for bulk eviction.

use std::borrow::Borrow;
use std::fmt;

use crate::config::CacheOptions;
use crate::error::{CacheError, Result};
use crate::tenant::{MultiTenancyConfig, TenantContext};

/// A fully namespaced cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedKey(String);

impl NormalizedKey {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for NormalizedKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Pure key normalizer
#[derive(Debug, Clone)]
pub struct KeyNormalizer {
    key_prefix: String,
    multi_tenancy: bool,
}

impl KeyNormalizer {
    pub fn new(options: &CacheOptions, multi_tenancy: MultiTenancyConfig) -> Self {
        Self {
            key_prefix: options.key_prefix.clone(),
            multi_tenancy: options.enable_multi_tenancy && multi_tenancy.is_enabled,
        }
    }

    /// Whether the tenant segment is applied
    pub fn multi_tenancy_enabled(&self) -> bool {
        self.multi_tenancy
    }

    pub fn normalize(&self, raw_key: &str, tenant: &TenantContext) -> Result<NormalizedKey> {
        if raw_key.is_empty() {
            return Err(CacheError::invalid_argument(
                "key",
                "cache key cannot be empty",
            ));
        }

        let mut key = String::with_capacity(
            raw_key.len() + self.key_prefix.len() + if self.multi_tenancy { 16 } else { 1 },
        );
        if let Some(segment) = self.tenant_segment(tenant) {
            key.push_str(&segment);
        }
        if !self.key_prefix.is_empty() {
            key.push_str(&self.key_prefix);
            key.push(':');
        }
        key.push_str(raw_key);

        Ok(NormalizedKey(key))
    }

    /// `tenant:<id|host>:` when multi-tenancy is on
    pub fn tenant_segment(&self, tenant: &TenantContext) -> Option<String> {
        self.multi_tenancy
            .then(|| format!("tenant:{}:", tenant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn normalizer(prefix: &str, multi_tenancy: bool) -> KeyNormalizer {
        let options = CacheOptions::default()
            .with_key_prefix(prefix)
            .with_multi_tenancy(multi_tenancy);
        KeyNormalizer::new(&options, MultiTenancyConfig::default())
    }

    #[test]
    fn test_tenant_and_prefix() {
        let n = normalizer("MyApp", true);
        let key = n.normalize("testKey", &TenantContext::tenant(456)).unwrap();
        assert_eq!(key.as_str(), "tenant:456:MyApp:testKey");

        let key = n.normalize("testKey", &TenantContext::host()).unwrap();
        assert_eq!(key.as_str(), "tenant:host:MyApp:testKey");
    }

    #[test]
    fn test_without_prefix() {
        let n = normalizer("", true);
        let key = n.normalize("k", &TenantContext::tenant(1)).unwrap();
        assert_eq!(key.as_str(), "tenant:1:k");
    }

    #[test]
    fn test_multi_tenancy_disabled() {
        let n = normalizer("MyApp", false);
        let key = n.normalize("k", &TenantContext::tenant(1)).unwrap();
        assert_eq!(key.as_str(), "MyApp:k");
        assert_eq!(n.tenant_segment(&TenantContext::tenant(1)), None);

        let options = CacheOptions::default().with_key_prefix("MyApp");
        let n = KeyNormalizer::new(&options, MultiTenancyConfig::disabled());
        assert!(!n.multi_tenancy_enabled());
        assert_eq!(n.normalize("k", &TenantContext::host()).unwrap().as_str(), "MyApp:k");
    }

    #[test]
    fn test_empty_key_rejected() {
        let n = normalizer("MyApp", true);
        assert_matches!(
            n.normalize("", &TenantContext::host()),
            Err(CacheError::InvalidArgument { argument: "key", .. })
        );
    }

    #[test]
    fn test_tenant_segment_is_prefix_of_keys() {
        let n = normalizer("MyApp", true);
        let tenant = TenantContext::tenant(9);
        let segment = n.tenant_segment(&tenant).unwrap();
        let key = n.normalize("orders", &tenant).unwrap();
        assert!(key.as_str().starts_with(&segment));
    }

    proptest! {
        #[test]
        fn prop_normalize_is_deterministic(
            key in "[a-zA-Z0-9:_]{1,32}",
            prefix in "[a-zA-Z]{0,8}",
            tenant in proptest::option::of(any::<i64>()),
        ) {
            let n = normalizer(&prefix, true);
            let ctx = TenantContext { tenant_id: tenant };
            prop_assert_eq!(n.normalize(&key, &ctx).unwrap(), n.normalize(&key, &ctx).unwrap());
        }

        #[test]
        fn prop_tenants_never_collide(
            key in "[a-zA-Z0-9:_]{1,32}",
            a in any::<i64>(),
            b in any::<i64>(),
        ) {
            prop_assume!(a != b);
            let n = normalizer("MyApp", true);
            prop_assert_ne!(
                n.normalize(&key, &TenantContext::tenant(a)).unwrap(),
                n.normalize(&key, &TenantContext::tenant(b)).unwrap()
            );
            prop_assert_ne!(
                n.normalize(&key, &TenantContext::tenant(a)).unwrap(),
                n.normalize(&key, &TenantContext::host()).unwrap()
            );
        }
    }
}
