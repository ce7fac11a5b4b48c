//! Metadata and price resolution behind the cache, limiter and retry policy.

use crate::pipeline::aggregator::SwapAggregator;
use crate::pipeline::cache::{CacheEntry, Lookup, PersistentCache};
use crate::pipeline::data_sources::{MetadataSource, PriceSource};
use crate::pipeline::rate_limit::RateLimiter;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::types::{LimitsConfig, Tradeability};
use crate::types::{Pubkey, TokenMetadata};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Chunking and retry knobs for one resolver.
#[derive(Debug, Clone, Copy)]
pub struct ResolverSettings {
    pub batch_size: usize,
    pub parallel_batches: usize,
    pub retry: RetryPolicy,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            parallel_batches: 2,
            retry: RetryPolicy::default(),
        }
    }
}

impl ResolverSettings {
    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self {
            batch_size: limits.batch_size.max(1),
            parallel_batches: limits.parallel_batches.max(1),
            retry: RetryPolicy::from_limits(limits),
        }
    }
}

struct TradeabilityCheck {
    aggregator: Arc<dyn SwapAggregator>,
    limiter: Arc<RateLimiter>,
}

/// Resolves mints to metadata with batch prices merged in.
pub struct MetadataResolver {
    metadata: Arc<dyn MetadataSource>,
    prices: Arc<dyn PriceSource>,
    limiter: Arc<RateLimiter>,
    cache: Arc<PersistentCache<TokenMetadata>>,
    settings: ResolverSettings,
    tradeability: Option<TradeabilityCheck>,
}

impl MetadataResolver {
    pub fn new(
        metadata: Arc<dyn MetadataSource>,
        prices: Arc<dyn PriceSource>,
        limiter: Arc<RateLimiter>,
        cache: Arc<PersistentCache<TokenMetadata>>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            metadata,
            prices,
            limiter,
            cache,
            settings,
            tradeability: None,
        }
    }

    /// Enable `check_tradeable` through the given aggregator and limiter.
    pub fn with_tradeability(mut self, aggregator: Arc<dyn SwapAggregator>, limiter: Arc<RateLimiter>) -> Self {
        self.tradeability = Some(TradeabilityCheck { aggregator, limiter });
        self
    }

    pub fn cache(&self) -> &Arc<PersistentCache<TokenMetadata>> {
        &self.cache
    }

    /// Resolve every mint. Each requested mint appears in the result exactly
    /// once; `None` means nothing could be fetched and nothing was cached.
    #[instrument(skip(self, mints), fields(requested = mints.len()))]
    pub async fn resolve(&self, mints: &[Pubkey]) -> HashMap<Pubkey, Option<TokenMetadata>> {
        let mut seen = HashSet::new();
        let unique: Vec<&Pubkey> = mints.iter().filter(|m| seen.insert(m.as_str())).collect();

        let mut resolved = HashMap::with_capacity(unique.len());
        let mut pending: Vec<(Pubkey, Option<CacheEntry<TokenMetadata>>)> = Vec::new();

        for mint in unique {
            match self.cache.lookup(mint).await {
                Lookup::Fresh(meta) => {
                    debug!("Cache hit for {}", mint);
                    resolved.insert(mint.clone(), Some(meta));
                }
                Lookup::Stale(entry) => pending.push((mint.clone(), Some(entry))),
                Lookup::Miss => pending.push((mint.clone(), None)),
            }
        }

        let cached = resolved.len();
        if pending.is_empty() {
            debug!("All {} mints served from cache", cached);
            return resolved;
        }

        let chunks: Vec<Vec<(Pubkey, Option<CacheEntry<TokenMetadata>>)>> = pending
            .chunks(self.settings.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let chunk_count = chunks.len();

        let fetched: Vec<Vec<(Pubkey, Option<TokenMetadata>)>> = stream::iter(chunks)
            .map(|chunk| self.resolve_chunk(chunk))
            .buffer_unordered(self.settings.parallel_batches)
            .collect()
            .await;

        let mut missing = 0;
        for (mint, meta) in fetched.into_iter().flatten() {
            if meta.is_none() {
                missing += 1;
            }
            resolved.insert(mint, meta);
        }

        info!(
            "Resolved {} mints ({} cached, {} chunks, {} unavailable)",
            resolved.len(),
            cached,
            chunk_count,
            missing
        );
        resolved
    }

    async fn resolve_chunk(
        &self,
        chunk: Vec<(Pubkey, Option<CacheEntry<TokenMetadata>>)>,
    ) -> Vec<(Pubkey, Option<TokenMetadata>)> {
        let mints: Vec<Pubkey> = chunk.iter().map(|(mint, _)| mint.clone()).collect();

        let prices = match self
            .settings
            .retry
            .run("price batch", || {
                self.limiter.schedule(|| self.prices.fetch_prices(&mints))
            })
            .await
        {
            Ok(prices) => Some(prices),
            Err(e) => {
                warn!("Price batch of {} mints failed: {:#}", mints.len(), e);
                None
            }
        };

        let tasks = chunk
            .into_iter()
            .map(|(mint, stale)| self.resolve_one(mint, stale, prices.as_ref()));
        futures::future::join_all(tasks).await
    }

    async fn resolve_one(
        &self,
        mint: Pubkey,
        stale: Option<CacheEntry<TokenMetadata>>,
        prices: Option<&HashMap<Pubkey, f64>>,
    ) -> (Pubkey, Option<TokenMetadata>) {
        let batch_price = prices.map(|p| p.get(&mint).copied().unwrap_or(0.0));

        let fetched = self
            .settings
            .retry
            .run("metadata", || {
                self.limiter.schedule(|| self.metadata.fetch_metadata(&mint))
            })
            .await;

        match fetched {
            Ok(mut meta) => {
                if let Some(price) = batch_price {
                    meta.price_usd = price;
                }
                if let Err(e) = self.cache.put(&mint, meta.clone()).await {
                    warn!("Failed to cache metadata for {}: {:#}", mint, e);
                }
                (mint, Some(meta))
            }
            Err(e) => {
                warn!("Metadata for {} unavailable: {:#}", mint, e);
                let fallback = match stale {
                    Some(entry) => {
                        if let Err(e) = self.cache.record_failure(&mint).await {
                            warn!("Failed to record refresh failure for {}: {:#}", mint, e);
                        }
                        let mut meta = entry.data;
                        if let Some(price) = batch_price {
                            meta.price_usd = price;
                        }
                        debug!("Serving stale metadata for {}", mint);
                        Some(meta)
                    }
                    None => None,
                };
                (mint, fallback)
            }
        }
    }

    /// Ask the quote endpoint whether each mint can be swapped into SOL.
    /// Failures are reported as non-tradeable with the reason.
    pub async fn check_tradeable(&self, mints: &[Pubkey]) -> HashMap<Pubkey, Tradeability> {
        let Some(check) = &self.tradeability else {
            return mints
                .iter()
                .map(|mint| {
                    (
                        mint.clone(),
                        Tradeability {
                            tradeable: false,
                            error: Some("no quote source configured".to_string()),
                        },
                    )
                })
                .collect();
        };

        let tasks = mints.iter().map(|mint| async move {
            let outcome = check
                .limiter
                .schedule(|| check.aggregator.tradeability(mint))
                .await
                .unwrap_or_else(|e| Tradeability {
                    tradeable: false,
                    error: Some(format!("{:#}", e)),
                });
            (mint.clone(), outcome)
        });

        futures::future::join_all(tasks).await.into_iter().collect()
    }

    /// Drop every cached metadata entry so the next `resolve` refetches.
    pub async fn invalidate_all(&self) -> Result<()> {
        self.cache.clear().await?;
        info!("Metadata cache cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReloadError;
    use crate::pipeline::clock::ManualClock;
    use crate::pipeline::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSource {
        calls: Mutex<HashMap<String, usize>>,
        failing: HashSet<String>,
    }

    impl CountingSource {
        fn failing(mints: &[&str]) -> Self {
            Self {
                calls: Mutex::new(HashMap::new()),
                failing: mints.iter().map(|m| m.to_string()).collect(),
            }
        }

        fn calls(&self, mint: &str) -> usize {
            self.calls.lock().unwrap().get(mint).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl MetadataSource for CountingSource {
        async fn fetch_metadata(&self, mint: &str) -> Result<TokenMetadata> {
            *self.calls.lock().unwrap().entry(mint.to_string()).or_default() += 1;
            if self.failing.contains(mint) {
                return Err(ReloadError::Transient("503".into()).into());
            }
            Ok(TokenMetadata {
                mint: mint.to_string(),
                name: format!("Token {}", mint),
                symbol: mint.to_uppercase(),
                logo_uri: None,
                decimals: 6,
                price_usd: 99.0,
            })
        }
    }

    #[derive(Default)]
    struct FixedPrices {
        batches: AtomicUsize,
    }

    #[async_trait]
    impl PriceSource for FixedPrices {
        async fn fetch_prices(&self, mints: &[Pubkey]) -> Result<HashMap<Pubkey, f64>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(mints.iter().map(|m| (m.clone(), 2.0)).collect())
        }
    }

    fn resolver(
        source: Arc<CountingSource>,
        prices: Arc<FixedPrices>,
        clock: &ManualClock,
        batch_size: usize,
    ) -> MetadataResolver {
        let cache = Arc::new(PersistentCache::new(
            "token_metadata",
            Duration::from_secs(300),
            1000,
            Arc::new(MemoryStore::new()),
            Arc::new(clock.clone()),
        ));
        MetadataResolver::new(
            source,
            prices,
            Arc::new(RateLimiter::sliding_window("metadata", 2, Duration::from_millis(1000))),
            cache,
            ResolverSettings {
                batch_size,
                parallel_batches: 2,
                retry: RetryPolicy::default(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_collapse_and_batch_price_wins() {
        let source = Arc::new(CountingSource::default());
        let prices = Arc::new(FixedPrices::default());
        let resolver = resolver(source.clone(), prices.clone(), &ManualClock::new(0), 100);

        let mints = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let resolved = resolver.resolve(&mints).await;

        assert_eq!(resolved.len(), 2);
        assert_eq!(source.calls("a"), 1);
        assert_eq!(resolved["a"].as_ref().unwrap().price_usd, 2.0);
        assert_eq!(prices.batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_by_batch_size() {
        let source = Arc::new(CountingSource::default());
        let prices = Arc::new(FixedPrices::default());
        let resolver = resolver(source, prices.clone(), &ManualClock::new(0), 2);

        let mints: Vec<Pubkey> = (0..5).map(|i| format!("m{}", i)).collect();
        let resolved = resolver.resolve(&mints).await;

        assert_eq!(resolved.len(), 5);
        assert_eq!(prices.batches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_cache_skips_network() {
        let source = Arc::new(CountingSource::default());
        let clock = ManualClock::new(0);
        let resolver = resolver(source.clone(), Arc::new(FixedPrices::default()), &clock, 100);

        resolver.resolve(&["a".to_string()]).await;
        clock.advance_ms(299_999);
        resolver.resolve(&["a".to_string()]).await;
        assert_eq!(source.calls("a"), 1);

        clock.advance_ms(1);
        resolver.resolve(&["a".to_string()]).await;
        assert_eq!(source.calls("a"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_falls_back_to_stale_entry() {
        let clock = ManualClock::new(0);
        let healthy = resolver(
            Arc::new(CountingSource::default()),
            Arc::new(FixedPrices::default()),
            &clock,
            100,
        );
        healthy.resolve(&["a".to_string()]).await;
        let cache = healthy.cache().clone();

        let failing = Arc::new(CountingSource::failing(&["a"]));
        let broken = MetadataResolver::new(
            failing.clone(),
            Arc::new(FixedPrices::default()),
            Arc::new(RateLimiter::sliding_window("metadata", 2, Duration::from_millis(1000))),
            cache.clone(),
            ResolverSettings::default(),
        );

        clock.advance_ms(400_000);
        let resolved = broken.resolve(&["a".to_string()]).await;

        assert_eq!(failing.calls("a"), 3);
        assert_eq!(resolved["a"].as_ref().unwrap().name, "Token a");
        match cache.lookup("a").await {
            Lookup::Stale(entry) => assert_eq!(entry.retry_count, 1),
            other => panic!("expected stale entry, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_all_forces_refetch() {
        let source = Arc::new(CountingSource::default());
        let resolver = resolver(source.clone(), Arc::new(FixedPrices::default()), &ManualClock::new(0), 100);

        resolver.resolve(&["a".to_string()]).await;
        resolver.invalidate_all().await.unwrap();
        resolver.resolve(&["a".to_string()]).await;
        assert_eq!(source.calls("a"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tradeability_without_aggregator() {
        let resolver = resolver(
            Arc::new(CountingSource::default()),
            Arc::new(FixedPrices::default()),
            &ManualClock::new(0),
            100,
        );
        let result = resolver.check_tradeable(&["a".to_string()]).await;
        assert!(!result["a"].tradeable);
    }
}
