//! Tenant and call context
//!
//! Every public cache operation receives a [`CacheContext`] from its caller.
//! It carries the tenant scope plus the caller's cancellation signal, so no
//! ambient session state is ever consulted.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, Result};

/// Tenant scope of a call. `None` denotes the shared host scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantContext {
    pub tenant_id: Option<i64>,
}

impl TenantContext {
    pub fn host() -> Self {
        Self { tenant_id: None }
    }

    pub fn tenant(id: i64) -> Self {
        Self {
            tenant_id: Some(id),
        }
    }

    pub fn is_host(&self) -> bool {
        self.tenant_id.is_none()
    }
}

impl std::fmt::Display for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tenant_id {
            Some(id) => write!(f, "{}", id),
            None => write!(f, "host"),
        }
    }
}

/// Multi-tenancy switch owned by the tenant subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MultiTenancyConfig {
    pub is_enabled: bool,
}

impl Default for MultiTenancyConfig {
    fn default() -> Self {
        Self { is_enabled: true }
    }
}

impl MultiTenancyConfig {
    pub fn disabled() -> Self {
        Self { is_enabled: false }
    }
}

/// Source of the current tenant at a request boundary
pub trait TenantProvider: Send + Sync {
    fn current_tenant(&self) -> TenantContext;
}

/// Provider that always reports the same tenant
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTenantProvider(pub TenantContext);

impl TenantProvider for FixedTenantProvider {
    fn current_tenant(&self) -> TenantContext {
        self.0
    }
}

// =============================================================================
// Call context
// =============================================================================

/// Per-call context: tenant scope, cancellation and optional deadline
#[derive(Debug, Clone, Default)]
pub struct CacheContext {
    pub tenant: TenantContext,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl CacheContext {
    pub fn new(tenant: TenantContext) -> Self {
        Self {
            tenant,
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn host() -> Self {
        Self::new(TenantContext::host())
    }

    pub fn for_tenant(id: i64) -> Self {
        Self::new(TenantContext::tenant(id))
    }

    /// Resolve the tenant once at the request boundary
    pub fn from_provider(provider: &dyn TenantProvider) -> Self {
        Self::new(provider.current_tenant())
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// A timeout too large to represent leaves the context without a deadline
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast if the caller already gave up
    pub fn check(&self, operation: &'static str) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(CacheError::cancelled(format!("{} cancelled by caller", operation)));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(CacheError::cancelled(format!("{} deadline elapsed", operation)));
        }
        Ok(())
    }

    /// Run `fut` until it completes, the token fires or the deadline passes
    pub async fn guard<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(operation)?;
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => {
                Err(CacheError::cancelled(format!("{} cancelled by caller", operation)))
            }
            _ = wait_deadline(self.deadline) => {
                Err(CacheError::cancelled(format!("{} deadline elapsed", operation)))
            }
            result = fut => result,
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_tenant_display() {
        assert_eq!(TenantContext::tenant(42).to_string(), "42");
        assert_eq!(TenantContext::host().to_string(), "host");
        assert!(TenantContext::default().is_host());
    }

    #[test]
    fn test_from_provider() {
        let provider = FixedTenantProvider(TenantContext::tenant(7));
        let ctx = CacheContext::from_provider(&provider);
        assert_eq!(ctx.tenant.tenant_id, Some(7));
    }

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let ctx = CacheContext::host();
        let value = ctx.guard("compute", async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_guard_observes_cancellation() {
        let token = CancellationToken::new();
        let ctx = CacheContext::host().with_cancellation(token.clone());
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<()> = ctx
            .guard("compute", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert_matches!(result, Err(CacheError::Cancelled { .. }));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_guard_observes_deadline() {
        let ctx = CacheContext::host().with_timeout(Duration::from_millis(10));
        let result: Result<()> = ctx
            .guard("compute", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert_matches!(result, Err(CacheError::Cancelled { .. }));
    }
}
