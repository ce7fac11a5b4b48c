//! Swap aggregator client: builds unsigned swap transactions and answers
//! tradeability questions.

use crate::error::ReloadError;
use crate::pipeline::data_sources::{check_status, read_json};
use crate::pipeline::types::{ApiConfig, Tradeability};
use crate::types::{Pubkey, WRAPPED_SOL_MINT};
use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use solana_sdk::transaction::VersionedTransaction;
use tracing::{debug, instrument};

/// Body of `POST /swap`. `amount` is in whole tokens.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRequest {
    pub from: Pubkey,
    pub to: Pubkey,
    pub amount: f64,
    pub slippage: f64,
    pub payer: Pubkey,
    pub priority_fee: f64,
}

#[async_trait]
pub trait SwapAggregator: Send + Sync {
    /// Unsigned transaction performing the swap. Its blockhash is replaced by
    /// the caller.
    async fn swap_transaction(&self, request: &SwapRequest) -> Result<VersionedTransaction>;

    /// Whether a route into wrapped SOL exists for `mint`.
    async fn tradeability(&self, mint: &str) -> Result<Tradeability>;
}

/// Solana Tracker swap API plus the Jupiter quote endpoint.
pub struct SolanaTrackerSwap {
    http: Client,
    swap_base_url: String,
    quote_url: String,
}

impl SolanaTrackerSwap {
    pub fn new(http: Client, swap_base_url: impl Into<String>, quote_url: impl Into<String>) -> Self {
        Self {
            http,
            swap_base_url: swap_base_url.into().trim_end_matches('/').to_string(),
            quote_url: quote_url.into(),
        }
    }

    pub fn from_config(http: Client, config: &ApiConfig) -> Self {
        Self::new(http, &config.swap_base_url, &config.quote_url)
    }
}

#[async_trait]
impl SwapAggregator for SolanaTrackerSwap {
    #[instrument(skip(self, request), fields(mint = %request.from))]
    async fn swap_transaction(&self, request: &SwapRequest) -> Result<VersionedTransaction> {
        let response = self
            .http
            .post(format!("{}/swap", self.swap_base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| ReloadError::Transient(format!("swap request: {}", e)))?;
        let response = check_status("swap", response).await?;
        let body = read_json("swap", response).await?;

        let txn = body
            .get("txn")
            .and_then(Value::as_str)
            .ok_or_else(|| ReloadError::malformed("swap", "response has no txn"))?;

        debug!("Received swap transaction for {}", request.from);
        decode_transaction(txn)
    }

    #[instrument(skip(self))]
    async fn tradeability(&self, mint: &str) -> Result<Tradeability> {
        let response = self
            .http
            .get(&self.quote_url)
            .query(&[
                ("inputMint", mint),
                ("outputMint", WRAPPED_SOL_MINT),
                ("amount", "1"),
            ])
            .send()
            .await
            .map_err(|e| ReloadError::Transient(format!("quote request: {}", e)))?;

        // The quote endpoint reports "no route" as a 4xx with an error body.
        let status = response.status();
        let response = if status.as_u16() == 429 || status.is_server_error() {
            check_status("quote", response).await?
        } else {
            response
        };
        let body = read_json("quote", response).await?;
        Ok(parse_tradeability(&body))
    }
}

/// Decode a base64, bincode-encoded versioned transaction.
pub fn decode_transaction(encoded: &str) -> Result<VersionedTransaction> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| ReloadError::malformed("swap", format!("bad base64: {}", e)))?;
    bincode::deserialize::<VersionedTransaction>(&bytes)
        .map_err(|e| ReloadError::malformed("swap", format!("bad transaction: {}", e)).into())
}

/// A quote is tradeable when it carries a non-empty `routePlan`, either at the
/// top level or under `data`.
pub fn parse_tradeability(body: &Value) -> Tradeability {
    if let Some(error) = body.get("error") {
        let reason = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Tradeability {
            tradeable: false,
            error: Some(reason),
        };
    }

    let has_route = [body.get("routePlan"), body.pointer("/data/routePlan")]
        .into_iter()
        .flatten()
        .filter_map(Value::as_array)
        .any(|plan| !plan.is_empty());

    if has_route {
        Tradeability {
            tradeable: true,
            error: None,
        }
    } else {
        Tradeability {
            tradeable: false,
            error: Some("No route available".to_string()),
        }
    }
}
