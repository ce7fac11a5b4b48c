//! Sweep pipeline: enumerate token accounts, resolve metadata and prices,
//! and submit swap, close or burn transactions.
//!
//! Every external dependency sits behind a trait so the pipeline can be
//! assembled against live services or test doubles through
//! [`PipelineBuilder`].

pub mod aggregator;
pub mod cache;
pub mod clock;
pub mod data_sources;
pub mod enumerator;
pub mod preparer;
pub mod rate_limit;
pub mod resolver;
pub mod retry;
pub mod rpc;
pub mod signer;
pub mod store;
pub mod submitter;
pub mod types;

pub use aggregator::{SolanaTrackerSwap, SwapAggregator, SwapRequest};
pub use cache::{CacheEntry, Lookup, PersistentCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use data_sources::{JupiterPriceClient, MetadataSource, PriceSource, SolanaTrackerClient};
pub use enumerator::{dust, Enumeration, TokenEnumerator};
pub use preparer::{JobPreparer, PrepareContext, TransactionPreparer};
pub use rate_limit::{RateLimitPolicy, RateLimitStats, RateLimiter};
pub use resolver::{MetadataResolver, ResolverSettings};
pub use retry::RetryPolicy;
pub use rpc::{LedgerClient, RpcManager, SolanaLedger};
pub use signer::{KeypairSigner, WalletSigner};
pub use store::{open_store, FileStore, KeyValueStore, MemoryStore, SqliteStore};
pub use submitter::{SendPolicy, Submitter, SubmitterSettings};
pub use types::{FeeConfig, PipelineConfig, StoreBackend, TokenListSnapshot, Tradeability};

use crate::types::{JobAction, Pubkey, SwapJob, TokenHolding, TokenMetadata};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Cache namespace for resolved token metadata.
pub const METADATA_NAMESPACE: &str = "token_metadata";

/// Pipeline builder with defaults for every piece that is not supplied.
pub struct PipelineBuilder {
    config: PipelineConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn KeyValueStore>>,
    ledger: Option<Arc<dyn LedgerClient>>,
    metadata: Option<Arc<dyn MetadataSource>>,
    prices: Option<Arc<dyn PriceSource>>,
    aggregator: Option<Arc<dyn SwapAggregator>>,
    preparer: Option<Arc<dyn TransactionPreparer>>,
}

impl PipelineBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::from_config(PipelineConfig::default())
    }

    pub fn from_config(config: PipelineConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            ledger: None,
            metadata: None,
            prices: None,
            aggregator: None,
            preparer: None,
        }
    }

    /// Set the primary and optional fallback RPC endpoints.
    pub fn with_rpc_endpoints(mut self, primary: impl Into<String>, fallback: Option<String>) -> Self {
        self.config.rpc.primary_url = primary.into();
        self.config.rpc.fallback_url = fallback;
        self
    }

    /// Set chunk size and chunk parallelism for metadata resolution.
    pub fn with_batching(mut self, batch_size: usize, parallel_batches: usize) -> Self {
        self.config.limits.batch_size = batch_size;
        self.config.limits.parallel_batches = parallel_batches;
        self
    }

    /// Set the metadata rate limit window.
    pub fn with_metadata_rate_limit(mut self, max_requests: u32, window_ms: u64) -> Self {
        self.config.limits.metadata_max_requests = max_requests;
        self.config.limits.metadata_window_ms = window_ms;
        self
    }

    /// Switch every limiter to the legacy fixed-interval policy.
    pub fn with_legacy_rate_limit(mut self, enabled: bool) -> Self {
        self.config.limits.legacy_fixed_interval = enabled;
        self
    }

    /// Set the metadata cache TTL in seconds.
    pub fn with_metadata_ttl(mut self, ttl_seconds: u64) -> Self {
        self.config.cache.metadata_ttl_seconds = ttl_seconds;
        self
    }

    pub fn with_store_backend(mut self, backend: StoreBackend, path: Option<String>) -> Self {
        self.config.cache.backend = backend;
        self.config.cache.path = path;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerClient>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_metadata_source(mut self, source: Arc<dyn MetadataSource>) -> Self {
        self.metadata = Some(source);
        self
    }

    pub fn with_price_source(mut self, source: Arc<dyn PriceSource>) -> Self {
        self.prices = Some(source);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn SwapAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn with_preparer(mut self, preparer: Arc<dyn TransactionPreparer>) -> Self {
        self.preparer = Some(preparer);
        self
    }

    /// Build the pipeline configuration.
    pub fn build_config(self) -> PipelineConfig {
        self.config
    }

    /// Assemble the pipeline. Pieces not supplied are built from the config.
    pub async fn build(self) -> Result<Pipeline> {
        let config = self.config;
        config.validate()?;

        let http = data_sources::http_client(&config.api)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.cache).await.context("Failed to open cache store")?,
        };
        let retry = RetryPolicy::from_limits(&config.limits);

        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(SolanaLedger::new(&config.rpc, retry)));
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(SolanaTrackerClient::from_config(http.clone(), &config.api)));
        let prices = self
            .prices
            .unwrap_or_else(|| Arc::new(JupiterPriceClient::from_config(http.clone(), &config.api)));
        let aggregator = self
            .aggregator
            .unwrap_or_else(|| Arc::new(SolanaTrackerSwap::from_config(http.clone(), &config.api)));
        let preparer: Arc<dyn TransactionPreparer> = match self.preparer {
            Some(preparer) => preparer,
            None => Arc::new(JobPreparer::new(aggregator.clone(), &config.submit, &config.fee)?),
        };

        let limits = &config.limits;
        let legacy = limits.legacy_fixed_interval;
        let metadata_limiter = Arc::new(limiter(
            "metadata",
            limits.metadata_max_requests,
            limits.metadata_window_ms,
            legacy,
        ));
        let swap_limiter = Arc::new(limiter("swap", limits.swap_max_requests, limits.swap_window_ms, legacy));
        let tradeability_limiter = Arc::new(limiter(
            "tradeability",
            limits.tradeability_requests_per_second,
            1000,
            legacy,
        ));

        let metadata_cache = Arc::new(PersistentCache::new(
            METADATA_NAMESPACE,
            config.cache.metadata_ttl(),
            config.cache.max_entries,
            store.clone(),
            clock.clone(),
        ));
        let snapshot_cache = Arc::new(PersistentCache::new(
            enumerator::SNAPSHOT_NAMESPACE,
            config.cache.token_list_ttl(),
            config.cache.max_entries,
            store,
            clock,
        ));

        let resolver = MetadataResolver::new(
            metadata,
            prices,
            metadata_limiter,
            metadata_cache.clone(),
            ResolverSettings::from_limits(limits),
        )
        .with_tradeability(aggregator, tradeability_limiter);

        let enumerator = TokenEnumerator::new(ledger.clone(), config.dust.denylist.clone(), snapshot_cache.clone());
        let submitter = Submitter::new(ledger, preparer, swap_limiter, SubmitterSettings::from(&config.submit));

        info!(
            "Pipeline ready (rpc {}, cache {:?}, legacy limiter {})",
            config.rpc.primary_url, config.cache.backend, legacy
        );

        Ok(Pipeline {
            config,
            enumerator,
            resolver,
            submitter,
            metadata_cache,
            snapshot_cache,
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Limiter for `max_requests` per `window_ms`, or the fixed-interval
/// equivalent when `legacy` is set.
pub fn limiter(name: &str, max_requests: u32, window_ms: u64, legacy: bool) -> RateLimiter {
    if legacy {
        let period = Duration::from_millis(window_ms) / max_requests.max(1);
        RateLimiter::new(name, RateLimitPolicy::every(period))
    } else {
        RateLimiter::sliding_window(name, max_requests, Duration::from_millis(window_ms))
    }
}

/// An assembled pipeline.
pub struct Pipeline {
    pub config: PipelineConfig,
    pub enumerator: TokenEnumerator,
    pub resolver: MetadataResolver,
    pub submitter: Submitter,
    pub metadata_cache: Arc<PersistentCache<TokenMetadata>>,
    pub snapshot_cache: Arc<PersistentCache<TokenListSnapshot>>,
}

/// What `Pipeline::scan` found for one wallet.
#[derive(Debug, Clone)]
pub struct WalletScan {
    pub owner: Pubkey,
    pub enumeration: Enumeration,
    pub metadata: HashMap<Pubkey, Option<TokenMetadata>>,
    /// Funded holdings below the dust threshold
    pub dust: Vec<TokenHolding>,
}

impl WalletScan {
    /// Total USD value of the funded holdings with a known price.
    pub fn total_usd(&self) -> f64 {
        self.enumeration
            .non_zero_balance
            .iter()
            .filter_map(|h| match self.metadata.get(&h.mint) {
                Some(Some(meta)) => Some(h.usd_value(meta.price_usd)),
                _ => None,
            })
            .sum()
    }
}

impl Pipeline {
    /// Enumerate the wallet (through the snapshot cache unless `refresh`),
    /// resolve metadata for its funded holdings and pick out the dust.
    pub async fn scan(&self, owner: &str, refresh: bool) -> Result<WalletScan> {
        if refresh {
            self.enumerator.forget(owner).await?;
        }
        let enumeration = self.enumerator.enumerate_cached(owner).await?;

        let mints: Vec<Pubkey> = enumeration
            .non_zero_balance
            .iter()
            .map(|h| h.mint.clone())
            .collect();
        let metadata = self.resolver.resolve(&mints).await;
        let dust = dust(&enumeration.non_zero_balance, &metadata, self.config.dust.threshold_usd);

        Ok(WalletScan {
            owner: owner.to_string(),
            enumeration,
            metadata,
            dust,
        })
    }

    /// One job per dust holding, plus the service fee when one is owed.
    pub fn sweep_jobs(&self, scan: &WalletScan, action: JobAction) -> Vec<SwapJob> {
        let mut jobs: Vec<SwapJob> = scan
            .dust
            .iter()
            .map(|h| SwapJob::for_holding(h, action))
            .collect();
        if let Some(lamports) = self.config.fee.swap_fee(jobs.len()) {
            jobs.push(SwapJob::service_fee(lamports));
        }
        jobs
    }

    /// Remove expired entries from every cache namespace.
    pub async fn sweep_caches(&self) -> Result<usize> {
        let metadata = self.metadata_cache.sweep_expired().await?;
        let snapshots = self.snapshot_cache.sweep_expired().await?;
        info!("Swept {} metadata and {} snapshot entries", metadata, snapshots);
        Ok(metadata + snapshots)
    }

    /// Drop every cached entry.
    pub async fn clear_caches(&self) -> Result<()> {
        self.resolver.invalidate_all().await?;
        self.snapshot_cache.clear().await
    }
}
