//! Cache configuration
//!
//! `CacheOptions` is the process-wide configuration, set once at startup and
//! read-only afterwards. `EntryOptions` is the per-entry value object derived
//! from it for every operation.
//!
//! ```text
//!   CacheOptions ──default_entry_options()──▶ EntryOptions (base template)
//!                                                  │
//!                        EntryOptionsPolicy::derive│(tenant context)
//!                                                  ▼
//!                                        EntryOptions (effective)
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Default sliding duration for entries
pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(30 * 60);

/// Maximum time an expired entry stays usable as a fail-safe fallback
pub const DEFAULT_FAIL_SAFE_MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Jitter applied to the base template when stampede protection is on
pub const DEFAULT_STAMPEDE_JITTER: Duration = Duration::from_millis(30);

/// Default eager refresh threshold (fraction of the entry lifetime)
pub const DEFAULT_EAGER_REFRESH_THRESHOLD: f32 = 0.9;

/// Default key prefix
pub const DEFAULT_KEY_PREFIX: &str = "TierCache";

/// Default L1 capacity in entries
pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

// =============================================================================
// Entry options
// =============================================================================

/// Eviction priority of an L1 entry. Lower priorities are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Effective options for a single cache entry.
///
/// This is a `Copy` value: every `with_*` call returns a new value and leaves
/// the receiver untouched, so a template can be shared freely between tasks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryOptions {
    /// Logical lifetime of the entry
    pub duration: Duration,
    /// Serve the expired value when a refresh fails
    pub fail_safe_enabled: bool,
    /// How long past expiry the value remains usable for fail-safe
    pub fail_safe_max_duration: Duration,
    /// Fraction of the lifetime after which a background refresh starts
    pub eager_refresh_threshold: Option<f32>,
    /// Upper bound of the random extension added to `duration`
    pub jitter_max_duration: Duration,
    /// L1 eviction priority
    pub priority: Priority,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_DURATION)
    }
}

impl EntryOptions {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            fail_safe_enabled: false,
            fail_safe_max_duration: DEFAULT_FAIL_SAFE_MAX_DURATION,
            eager_refresh_threshold: None,
            jitter_max_duration: Duration::ZERO,
            priority: Priority::Normal,
        }
    }

    pub fn with_duration(self, duration: Duration) -> Self {
        Self { duration, ..self }
    }

    /// Enable or disable fail-safe, keeping the current max duration
    pub fn with_fail_safe(self, enabled: bool) -> Self {
        Self {
            fail_safe_enabled: enabled,
            ..self
        }
    }

    pub fn with_fail_safe_max(self, enabled: bool, max_duration: Duration) -> Self {
        Self {
            fail_safe_enabled: enabled,
            fail_safe_max_duration: max_duration,
            ..self
        }
    }

    pub fn with_eager_refresh(self, threshold: Option<f32>) -> Self {
        Self {
            eager_refresh_threshold: threshold,
            ..self
        }
    }

    pub fn with_jitter(self, jitter_max_duration: Duration) -> Self {
        Self {
            jitter_max_duration,
            ..self
        }
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }
}

// =============================================================================
// Scope tuning
// =============================================================================

/// Adjustments applied by tenant/host scope derivation.
///
/// Defaults reproduce the fixed behaviour: tenant entries live 0.75x as long
/// with a 1 hour fail-safe window, host entries 1.5x with 4 hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScopeTuning {
    /// Duration multiplier for tenant-scoped entries
    pub tenant_duration_factor: f64,
    /// Duration multiplier for host-scoped entries
    pub host_duration_factor: f64,
    /// Fail-safe window enabled on tenant entries that had none
    #[serde(with = "humantime_serde")]
    pub tenant_fail_safe_max: Duration,
    /// Fail-safe window enabled on host entries that had none
    #[serde(with = "humantime_serde")]
    pub host_fail_safe_max: Duration,
    /// Lower bound of the per-tenant jitter window
    #[serde(with = "humantime_serde")]
    pub tenant_jitter_base: Duration,
    /// Number of distinct per-tenant jitter slots (1 ms apart)
    pub tenant_jitter_slots: u32,
    /// Fixed jitter for host entries
    #[serde(with = "humantime_serde")]
    pub host_jitter: Duration,
    /// Added to the eager refresh threshold for host entries
    pub host_eager_refresh_offset: f32,
    /// Upper bound of the host eager refresh threshold
    pub host_eager_refresh_cap: f32,
}

impl Default for ScopeTuning {
    fn default() -> Self {
        Self {
            tenant_duration_factor: 0.75,
            host_duration_factor: 1.5,
            tenant_fail_safe_max: Duration::from_secs(60 * 60),
            host_fail_safe_max: Duration::from_secs(4 * 60 * 60),
            tenant_jitter_base: Duration::from_millis(50),
            tenant_jitter_slots: 100,
            host_jitter: Duration::from_millis(25),
            host_eager_refresh_offset: 0.1,
            host_eager_refresh_cap: 0.95,
        }
    }
}

// =============================================================================
// Process-wide options
// =============================================================================

/// Process-wide cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheOptions {
    /// Sliding duration used when an entry specifies none
    #[serde(with = "humantime_serde")]
    pub default_duration: Duration,
    /// Enable the in-process L1 tier
    pub enable_memory_cache: bool,
    /// Maximum number of entries held in L1
    pub memory_capacity: usize,
    /// Enable the distributed L2 tier
    pub enable_distributed_cache: bool,
    /// Registered name of the L2 provider
    pub distributed_provider_name: Option<String>,
    /// Serve stale values when a refresh fails
    pub enable_fail_safe: bool,
    /// Coalesce concurrent computations of the same key
    pub enable_stampede_protection: bool,
    /// Refresh entries in the background before they expire
    pub enable_eager_refresh: bool,
    /// Lifetime fraction that triggers an eager refresh
    pub eager_refresh_threshold: f32,
    /// Namespace keys and tune entries per tenant
    pub enable_multi_tenancy: bool,
    /// Global key prefix, nested inside the tenant segment
    pub key_prefix: String,
    /// Publish invalidations to peer instances
    pub enable_backplane: bool,
    /// Registered name of the backplane provider
    pub backplane_provider_name: Option<String>,
    /// Tenant/host derivation constants
    pub scope_tuning: ScopeTuning,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            default_duration: DEFAULT_CACHE_DURATION,
            enable_memory_cache: true,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            enable_distributed_cache: false,
            distributed_provider_name: None,
            enable_fail_safe: true,
            enable_stampede_protection: true,
            enable_eager_refresh: false,
            eager_refresh_threshold: DEFAULT_EAGER_REFRESH_THRESHOLD,
            enable_multi_tenancy: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            enable_backplane: false,
            backplane_provider_name: None,
            scope_tuning: ScopeTuning::default(),
        }
    }
}

impl CacheOptions {
    /// Parse options from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let options: CacheOptions = serde_yaml::from_str(yaml)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CacheError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Reject option combinations that cannot produce a working cache
    pub fn validate(&self) -> Result<()> {
        if self.default_duration.is_zero() {
            return Err(CacheError::Config("defaultDuration must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.eager_refresh_threshold) {
            return Err(CacheError::Config(format!(
                "eagerRefreshThreshold must be within [0, 1], got {}",
                self.eager_refresh_threshold
            )));
        }
        if self.enable_memory_cache && self.memory_capacity == 0 {
            return Err(CacheError::Config("memoryCapacity must be positive".into()));
        }
        if self.enable_distributed_cache && is_blank(&self.distributed_provider_name) {
            return Err(CacheError::Config(
                "distributed cache enabled without distributedProviderName".into(),
            ));
        }
        if self.enable_backplane && is_blank(&self.backplane_provider_name) {
            return Err(CacheError::Config(
                "backplane enabled without backplaneProviderName".into(),
            ));
        }
        let tuning = &self.scope_tuning;
        if tuning.tenant_duration_factor <= 0.0 || tuning.host_duration_factor <= 0.0 {
            return Err(CacheError::Config("scope duration factors must be positive".into()));
        }
        if tuning.tenant_jitter_slots == 0 {
            return Err(CacheError::Config("tenantJitterSlots must be positive".into()));
        }
        Ok(())
    }

    /// Base entry template every operation starts from
    pub fn default_entry_options(&self) -> EntryOptions {
        let jitter = if self.enable_stampede_protection {
            DEFAULT_STAMPEDE_JITTER
        } else {
            Duration::ZERO
        };
        EntryOptions::new(self.default_duration)
            .with_fail_safe(self.enable_fail_safe)
            .with_eager_refresh(
                self.enable_eager_refresh
                    .then_some(self.eager_refresh_threshold),
            )
            .with_jitter(jitter)
    }

    pub fn with_default_duration(mut self, duration: Duration) -> Self {
        self.default_duration = duration;
        self
    }

    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity;
        self
    }

    pub fn with_distributed_cache(mut self, provider: impl Into<String>) -> Self {
        self.enable_distributed_cache = true;
        self.distributed_provider_name = Some(provider.into());
        self
    }

    pub fn with_backplane(mut self, provider: impl Into<String>) -> Self {
        self.enable_backplane = true;
        self.backplane_provider_name = Some(provider.into());
        self
    }

    pub fn with_fail_safe(mut self, enabled: bool) -> Self {
        self.enable_fail_safe = enabled;
        self
    }

    pub fn with_stampede_protection(mut self, enabled: bool) -> Self {
        self.enable_stampede_protection = enabled;
        self
    }

    pub fn with_eager_refresh(mut self, threshold: f32) -> Self {
        self.enable_eager_refresh = true;
        self.eager_refresh_threshold = threshold;
        self
    }

    pub fn with_multi_tenancy(mut self, enabled: bool) -> Self {
        self.enable_multi_tenancy = enabled;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_scope_tuning(mut self, tuning: ScopeTuning) -> Self {
        self.scope_tuning = tuning;
        self
    }

    /// Backplane channel for a named cache: `{prefix}:backplane:{cache}`
    pub fn backplane_channel(&self, cache_name: &str) -> String {
        if self.key_prefix.is_empty() {
            format!("backplane:{}", cache_name)
        } else {
            format!("{}:backplane:{}", self.key_prefix, cache_name)
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let options = CacheOptions::default();
        assert_eq!(options.default_duration, Duration::from_secs(1800));
        assert!(options.enable_memory_cache);
        assert!(!options.enable_distributed_cache);
        assert!(options.enable_fail_safe);
        assert!(options.enable_stampede_protection);
        assert!(!options.enable_eager_refresh);
        assert_eq!(options.eager_refresh_threshold, 0.9);
        assert!(options.enable_multi_tenancy);
        assert_eq!(options.key_prefix, "TierCache");
        assert!(!options.enable_backplane);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_default_entry_options() {
        let base = CacheOptions::default().default_entry_options();
        assert_eq!(base.duration, Duration::from_secs(1800));
        assert!(base.fail_safe_enabled);
        assert_eq!(base.jitter_max_duration, Duration::from_millis(30));
        assert_eq!(base.eager_refresh_threshold, None);
        assert_eq!(base.priority, Priority::Normal);

        let base = CacheOptions::default()
            .with_stampede_protection(false)
            .with_eager_refresh(0.8)
            .default_entry_options();
        assert_eq!(base.jitter_max_duration, Duration::ZERO);
        assert_eq!(base.eager_refresh_threshold, Some(0.8));
    }

    #[test]
    fn test_entry_options_with_returns_copy() {
        let base = EntryOptions::new(Duration::from_secs(60));
        let derived = base.with_priority(Priority::High).with_duration(Duration::from_secs(5));
        assert_eq!(base.priority, Priority::Normal);
        assert_eq!(base.duration, Duration::from_secs(60));
        assert_eq!(derived.priority, Priority::High);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
defaultDuration: 10m
keyPrefix: MyApp
enableDistributedCache: true
distributedProviderName: InMemory
scopeTuning:
  hostFailSafeMax: 2h
"#;
        let options = CacheOptions::from_yaml_str(yaml).unwrap();
        assert_eq!(options.default_duration, Duration::from_secs(600));
        assert_eq!(options.key_prefix, "MyApp");
        assert_eq!(options.distributed_provider_name.as_deref(), Some("InMemory"));
        assert_eq!(options.scope_tuning.host_fail_safe_max, Duration::from_secs(7200));
        assert_eq!(options.scope_tuning.tenant_duration_factor, 0.75);
    }

    #[test]
    fn test_validate_rejects_bad_combinations() {
        let options = CacheOptions {
            enable_backplane: true,
            ..Default::default()
        };
        assert_matches!(options.validate(), Err(CacheError::Config(_)));

        let options = CacheOptions {
            eager_refresh_threshold: 1.5,
            ..Default::default()
        };
        assert_matches!(options.validate(), Err(CacheError::Config(_)));

        let options = CacheOptions {
            enable_distributed_cache: true,
            distributed_provider_name: Some("  ".into()),
            ..Default::default()
        };
        assert_matches!(options.validate(), Err(CacheError::Config(_)));

        assert_matches!(
            CacheOptions::from_yaml_str("defaultDuration: 0s"),
            Err(CacheError::Config(_))
        );
    }

    #[test]
    fn test_backplane_channel_includes_prefix() {
        let options = CacheOptions::default().with_key_prefix("MyApp");
        assert_eq!(options.backplane_channel("Products"), "MyApp:backplane:Products");
        let options = CacheOptions::default().with_key_prefix("");
        assert_eq!(options.backplane_channel("Products"), "backplane:Products");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
    }
}
