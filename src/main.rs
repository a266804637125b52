//! TierCache Demo
//!
//! Runs two simulated service instances in one process. They share an
//! in-memory distributed tier and an in-memory backplane, and cache a small
//! product catalog on behalf of several tenants.
//!
//! ```text
//! ┌──────────────┐                     ┌──────────────┐
//! │  instance-a  │                     │  instance-b  │
//! │  L1 memory   │                     │  L1 memory   │
//! └──────┬───────┘                     └──────┬───────┘
//!        │        ┌───────────────────┐       │
//!        ├───────▶│ shared L2 (InMem) │◀──────┤
//!        │        └───────────────────┘       │
//!        │        ┌───────────────────┐       │
//!        └───────▶│ backplane (InMem) │───────┘
//!                 └───────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::providers::IN_MEMORY_PROVIDER;
use tiercache::{
    CacheContext, CacheError, CacheManager, CacheOptions, EntryOptions, ProviderRegistry,
    ProviderSettings, TieredCache,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// TierCache demo - two instances sharing L2 and a backplane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML file with cache options
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// YAML file with provider connection settings
    #[arg(long, env = "TIERCACHE_PROVIDER_CONFIG")]
    provider_config: Option<PathBuf>,

    /// Key and channel prefix
    #[arg(long, env = "TIERCACHE_KEY_PREFIX")]
    key_prefix: Option<String>,

    /// Concurrent callers in the stampede demo
    #[arg(long, env = "TIERCACHE_CONCURRENCY", default_value = "50")]
    concurrency: usize,

    /// Simulated database latency in milliseconds
    #[arg(long, env = "TIERCACHE_DB_LATENCY_MS", default_value = "100")]
    db_latency_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Product catalog
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Product {
    id: u32,
    name: String,
    price_cents: u64,
}

/// Slow backing store the caches sit in front of
struct Catalog {
    latency: Duration,
    online: AtomicBool,
    queries: AtomicUsize,
    price_bump: AtomicUsize,
}

impl Catalog {
    fn new(latency: Duration) -> Self {
        Self {
            latency,
            online: AtomicBool::new(true),
            queries: AtomicUsize::new(0),
            price_bump: AtomicUsize::new(0),
        }
    }

    async fn load(&self, tenant: &CacheContext, id: u32) -> Result<Product, CacheError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        if !self.online.load(Ordering::SeqCst) {
            return Err(CacheError::upstream_msg("catalog database unreachable"));
        }
        let bump = self.price_bump.load(Ordering::SeqCst) as u64;
        Ok(Product {
            id,
            name: format!("{} product #{}", tenant.tenant, id),
            price_cents: 1_000 + u64::from(id) * 100 + bump,
        })
    }

    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

async fn product(
    cache: &TieredCache,
    catalog: &Arc<Catalog>,
    ctx: &CacheContext,
    id: u32,
    options: Option<EntryOptions>,
) -> tiercache::Result<Product> {
    let catalog = Arc::clone(catalog);
    let tenant = ctx.clone();
    cache
        .get_or_compute(
            &format!("product:{}", id),
            ctx,
            move || async move { catalog.load(&tenant, id).await },
            options,
        )
        .await
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let mut options = match &args.config {
        Some(path) => CacheOptions::from_yaml_file(path)
            .with_context(|| format!("loading cache options from {}", path.display()))?,
        None => CacheOptions::default(),
    };
    if let Some(prefix) = &args.key_prefix {
        options.key_prefix = prefix.clone();
    }
    if !options.enable_distributed_cache {
        options = options.with_distributed_cache(IN_MEMORY_PROVIDER);
    }
    if !options.enable_backplane {
        options = options.with_backplane(IN_MEMORY_PROVIDER);
    }
    let settings = match &args.provider_config {
        Some(path) => ProviderSettings::from_yaml_file(path)
            .with_context(|| format!("loading provider settings from {}", path.display()))?,
        None => ProviderSettings::default(),
    };

    info!("Starting TierCache demo");
    info!("  Key prefix: {}", options.key_prefix);
    info!("  Default duration: {:?}", options.default_duration);
    info!("  Distributed provider: {:?}", options.distributed_provider_name);
    info!("  Backplane provider: {:?}", options.backplane_provider_name);

    // One registry stands in for shared infrastructure: both instances
    // resolve the same in-memory store and hub from it.
    let registry = Arc::new(ProviderRegistry::with_defaults());
    let instance_a = CacheManager::new(options.clone(), registry.clone(), settings.clone())?;
    let instance_b = CacheManager::new(options, registry, settings)?;

    let catalog = Arc::new(Catalog::new(Duration::from_millis(args.db_latency_ms)));
    let cache_a = instance_a.get_cache("Products").await?;
    let cache_b = instance_b.get_cache("Products").await?;

    demo_tenant_keys(&cache_a)?;
    demo_stampede(&cache_a, &catalog, args.concurrency).await?;
    demo_backplane(&cache_a, &cache_b, &catalog).await?;
    demo_fail_safe(&cache_a, &catalog).await?;

    for cache in [&cache_a, &cache_b] {
        let m = cache.metrics();
        info!(
            instance = %cache.instance_id(),
            l1_hits = m.l1_hits,
            l1_misses = m.l1_misses,
            l2_hits = m.l2_hits,
            factory_calls = m.factory_calls,
            coalesced_waits = m.coalesced_waits,
            stale_served = m.stale_served,
            backplane_received = m.backplane_received,
            "Cache metrics"
        );
    }

    instance_a.dispose();
    instance_b.dispose();
    info!("Demo complete");
    Ok(())
}

fn demo_tenant_keys(cache: &TieredCache) -> tiercache::Result<()> {
    for ctx in [
        CacheContext::for_tenant(1),
        CacheContext::for_tenant(2),
        CacheContext::host(),
    ] {
        let key = cache.normalize_key("product:1", &ctx)?;
        let options = cache.entry_options_for("product:1", &ctx, None)?;
        info!(
            tenant = %ctx.tenant,
            key = %key,
            duration = ?options.duration,
            jitter = ?options.jitter_max_duration,
            priority = ?options.priority,
            "Tenant key layout"
        );
    }
    Ok(())
}

async fn demo_stampede(
    cache: &Arc<TieredCache>,
    catalog: &Arc<Catalog>,
    concurrency: usize,
) -> anyhow::Result<()> {
    let before = catalog.queries();
    let ctx = CacheContext::for_tenant(1);
    let callers = (0..concurrency.max(1)).map(|_| {
        let cache = Arc::clone(cache);
        let catalog = Arc::clone(catalog);
        let ctx = ctx.clone();
        tokio::spawn(async move { product(&cache, &catalog, &ctx, 1, None).await })
    });

    let results = futures::future::try_join_all(callers).await?;
    let products = results.into_iter().collect::<tiercache::Result<Vec<_>>>()?;
    info!(
        callers = products.len(),
        database_queries = catalog.queries() - before,
        "Stampede coalesced"
    );
    Ok(())
}

async fn demo_backplane(
    cache_a: &TieredCache,
    cache_b: &TieredCache,
    catalog: &Arc<Catalog>,
) -> anyhow::Result<()> {
    let ctx = CacheContext::for_tenant(2);
    let seen_by_b = product(cache_b, catalog, &ctx, 7, None).await?;
    info!(price = seen_by_b.price_cents, "instance-b cached product 7");

    let mut updated = seen_by_b.clone();
    updated.price_cents += 250;
    cache_a.set("product:7", &ctx, &updated, None, None).await?;

    // Give the backplane a moment to reach instance-b
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = product(cache_b, catalog, &ctx, 7, None).await?;
    info!(
        before = seen_by_b.price_cents,
        after = after.price_cents,
        "instance-b sees instance-a's update"
    );
    Ok(())
}

async fn demo_fail_safe(cache: &TieredCache, catalog: &Arc<Catalog>) -> anyhow::Result<()> {
    let ctx = CacheContext::for_tenant(3);
    let short = EntryOptions::new(Duration::from_millis(200))
        .with_fail_safe_max(true, Duration::from_secs(60));

    let fresh = product(cache, catalog, &ctx, 9, Some(short)).await?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    catalog.online.store(false, Ordering::SeqCst);
    catalog.price_bump.store(999, Ordering::SeqCst);
    match product(cache, catalog, &ctx, 9, Some(short)).await {
        Ok(stale) => info!(
            price = stale.price_cents,
            matches_last_value = stale == fresh,
            "Database down, fail-safe served the last value"
        ),
        Err(e) => warn!(error = %e, "Fail-safe could not cover the outage"),
    }
    catalog.online.store(true, Ordering::SeqCst);
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
