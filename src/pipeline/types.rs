//! Configuration and shared records for the sweep pipeline.

use crate::error::ReloadError;
use crate::types::{Pubkey, TokenHolding};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Full pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub rpc: RpcConfig,
    pub api: ApiConfig,
    pub limits: LimitsConfig,
    pub cache: CacheConfig,
    pub submit: SubmitConfig,
    pub dust: DustConfig,
    pub fee: FeeConfig,
}

/// Solana RPC endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub primary_url: String,
    /// Switched to when the primary answers with a rate-limit error
    pub fallback_url: Option<String>,
    pub timeout_seconds: u64,
    /// Attempts across endpoints before a rate-limit error is surfaced
    pub max_switches: usize,
}

/// Third-party HTTP services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub metadata_base_url: String,
    pub metadata_api_key: Option<String>,
    pub price_url: String,
    pub swap_base_url: String,
    pub quote_url: String,
    pub http_timeout_seconds: u64,
}

/// Pacing, batching and retry knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub metadata_max_requests: u32,
    pub metadata_window_ms: u64,
    pub swap_max_requests: u32,
    pub swap_window_ms: u64,
    pub tradeability_requests_per_second: u32,
    /// Use the legacy one-per-interval limiter instead of the sliding window
    pub legacy_fixed_interval: bool,
    pub batch_size: usize,
    pub parallel_batches: usize,
    pub max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

/// Cache TTLs and storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub metadata_ttl_seconds: u64,
    pub token_list_ttl_seconds: u64,
    pub max_entries: u64,
    pub backend: StoreBackend,
    /// File or SQLite path for the persistent backends
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
    Sqlite,
}

/// Submission parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitConfig {
    pub send_group_size: usize,
    pub concurrent_sends: bool,
    pub prepare_timeout_ms: u64,
    pub confirm_timeout_ms: u64,
    pub confirm_poll_ms: u64,
    /// Slippage tolerance in percent
    pub slippage: f64,
    /// Priority fee in SOL
    pub priority_fee: f64,
}

/// Service fee and compute budget for the transactions built locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Fee wallet; nothing is charged when unset
    pub recipient: Option<Pubkey>,
    /// Lamports sent to the recipient with every account close
    pub close_fee_lamports: u64,
    /// Lamports per swapped token, charged once per sweep
    pub swap_fee_lamports_per_token: u64,
    /// Micro-lamports per compute unit, 0 to omit
    pub compute_unit_price: u64,
    /// Compute unit limit, 0 to omit
    pub compute_unit_limit: u32,
}

/// Dust definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DustConfig {
    pub threshold_usd: f64,
    pub denylist: Vec<Pubkey>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            primary_url: "https://api.mainnet-beta.solana.com".to_string(),
            fallback_url: None,
            timeout_seconds: 30,
            max_switches: 3,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            metadata_base_url: "https://data.solanatracker.io".to_string(),
            metadata_api_key: None,
            price_url: "https://api.jup.ag/price/v2".to_string(),
            swap_base_url: "https://swap-v2.solanatracker.io".to_string(),
            quote_url: "https://quote-api.jup.ag/v6/quote".to_string(),
            http_timeout_seconds: 10,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            metadata_max_requests: 2,
            metadata_window_ms: 1000,
            swap_max_requests: 10,
            swap_window_ms: 1000,
            tradeability_requests_per_second: 2,
            legacy_fixed_interval: false,
            batch_size: 100,
            parallel_batches: 2,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 8000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_ttl_seconds: 5 * 60,
            token_list_ttl_seconds: 60 * 60,
            max_entries: 10_000,
            backend: StoreBackend::Memory,
            path: None,
        }
    }
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            send_group_size: 10,
            concurrent_sends: true,
            prepare_timeout_ms: 30_000,
            confirm_timeout_ms: 60_000,
            confirm_poll_ms: 1_000,
            slippage: 10.0,
            priority_fee: 0.0001,
        }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            recipient: None,
            close_fee_lamports: 1_000_000,
            swap_fee_lamports_per_token: 1_000_000,
            compute_unit_price: 5_000_000,
            compute_unit_limit: 10_000,
        }
    }
}

impl FeeConfig {
    /// Fee for a sweep of `tokens` holdings, `None` when nothing is owed.
    pub fn swap_fee(&self, tokens: usize) -> Option<u64> {
        self.recipient.as_ref()?;
        let fee = self.swap_fee_lamports_per_token.saturating_mul(tokens as u64);
        (fee > 0).then_some(fee)
    }
}

impl Default for DustConfig {
    fn default() -> Self {
        Self {
            threshold_usd: 1.0,
            denylist: vec![
                // USDC
                "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string(),
                // USDT
                "Es9vMFrMKRTj8JvEHKkVX8y8NrBNs8tBzJyCkStqxRG".to_string(),
                crate::types::WRAPPED_SOL_MINT.to_string(),
            ],
        }
    }
}

impl LimitsConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl CacheConfig {
    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_seconds)
    }

    pub fn token_list_ttl(&self) -> Duration {
        Duration::from_secs(self.token_list_ttl_seconds)
    }
}

impl PipelineConfig {
    /// Reject settings that would stall or divide by zero at runtime.
    pub fn validate(&self) -> Result<(), ReloadError> {
        if self.rpc.primary_url.trim().is_empty() {
            return Err(ReloadError::Config("rpc.primary_url is empty".into()));
        }
        if self.limits.batch_size == 0 || self.limits.parallel_batches == 0 {
            return Err(ReloadError::Config("batch_size and parallel_batches must be positive".into()));
        }
        if self.limits.max_attempts == 0 {
            return Err(ReloadError::Config("max_attempts must be at least 1".into()));
        }
        if self.limits.metadata_max_requests == 0 || self.limits.swap_max_requests == 0 {
            return Err(ReloadError::Config("rate limits must allow at least one request".into()));
        }
        if self.submit.send_group_size == 0 {
            return Err(ReloadError::Config("submit.send_group_size must be positive".into()));
        }
        if self.cache.backend != StoreBackend::Memory && self.cache.path.is_none() {
            return Err(ReloadError::Config("cache.path is required for persistent backends".into()));
        }
        if let Some(recipient) = &self.fee.recipient {
            crate::pipeline::rpc::parse_address(recipient)
                .map_err(|e| ReloadError::Config(format!("fee.recipient: {:#}", e)))?;
        }
        Ok(())
    }
}

/// Last-known token list for one wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenListSnapshot {
    pub owner: Pubkey,
    pub zero_balance: Vec<TokenHolding>,
    pub non_zero_balance: Vec<TokenHolding>,
}

/// Whether a mint currently has a swap route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tradeability {
    pub tradeable: bool,
    pub error: Option<String>,
}
