//! Tenant-aware entry options derivation
//!
//! Tenant data is treated as more volatile (shorter lifetime, higher L1
//! priority, per-tenant jitter slot); host data as shared and stable (longer
//! lifetime, wider fail-safe window, capped eager refresh, small fixed
//! jitter). Derivation is a pure function of its inputs.

use std::time::Duration;

use crate::config::{CacheOptions, EntryOptions, Priority, ScopeTuning};
use crate::tenant::{MultiTenancyConfig, TenantContext};

use super::key::NormalizedKey;

/// Derives effective entry options from a tenant-agnostic base
#[derive(Debug, Clone)]
pub struct EntryOptionsPolicy {
    multi_tenancy: bool,
    eager_refresh: Option<f32>,
    stampede_protection: bool,
    tuning: ScopeTuning,
}

impl EntryOptionsPolicy {
    pub fn new(options: &CacheOptions, multi_tenancy: MultiTenancyConfig) -> Self {
        Self {
            multi_tenancy: options.enable_multi_tenancy && multi_tenancy.is_enabled,
            eager_refresh: options
                .enable_eager_refresh
                .then_some(options.eager_refresh_threshold),
            stampede_protection: options.enable_stampede_protection,
            tuning: options.scope_tuning.clone(),
        }
    }

    /// Effective options for `key` under `tenant`. `base` is never modified.
    pub fn derive(
        &self,
        base: &EntryOptions,
        _key: &NormalizedKey,
        tenant: &TenantContext,
    ) -> EntryOptions {
        if !self.multi_tenancy {
            return *base;
        }

        match tenant.tenant_id {
            Some(id) => self.tenant_scope(*base, id),
            None => self.host_scope(*base),
        }
    }

    fn tenant_scope(&self, base: EntryOptions, tenant_id: i64) -> EntryOptions {
        let mut options = base
            .with_duration(scale(base.duration, self.tuning.tenant_duration_factor))
            .with_priority(Priority::High);

        if !options.fail_safe_enabled {
            options = options.with_fail_safe_max(true, self.tuning.tenant_fail_safe_max);
        }
        if let Some(threshold) = self.eager_refresh {
            options = options.with_eager_refresh(Some(threshold));
        }
        if self.stampede_protection {
            options = options.with_jitter(self.tenant_jitter(tenant_id));
        }
        options
    }

    fn host_scope(&self, base: EntryOptions) -> EntryOptions {
        let mut options = base
            .with_duration(scale(base.duration, self.tuning.host_duration_factor))
            .with_priority(Priority::Normal);

        if !options.fail_safe_enabled {
            options = options.with_fail_safe_max(true, self.tuning.host_fail_safe_max);
        }
        if let Some(threshold) = self.eager_refresh {
            let adjusted = (threshold + self.tuning.host_eager_refresh_offset)
                .min(self.tuning.host_eager_refresh_cap);
            options = options.with_eager_refresh(Some(adjusted));
        }
        if self.stampede_protection {
            options = options.with_jitter(self.tuning.host_jitter);
        }
        options
    }

    /// `(id mod slots) + base`, Euclidean so negative ids stay in range
    fn tenant_jitter(&self, tenant_id: i64) -> Duration {
        let slot = tenant_id.rem_euclid(i64::from(self.tuning.tenant_jitter_slots)) as u64;
        self.tuning
            .tenant_jitter_base
            .saturating_add(Duration::from_millis(slot))
    }
}

fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}
