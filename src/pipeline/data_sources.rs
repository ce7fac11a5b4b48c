//! HTTP clients for token metadata and prices.

use crate::error::ReloadError;
use crate::pipeline::types::ApiConfig;
use crate::types::{Pubkey, TokenMetadata};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

pub const DEFAULT_TOKEN_NAME: &str = "Unknown Token";
pub const DEFAULT_TOKEN_SYMBOL: &str = "UNKNOWN";
pub const DEFAULT_TOKEN_DECIMALS: u8 = 9;

/// Per-mint descriptive metadata.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_metadata(&self, mint: &str) -> Result<TokenMetadata>;
}

/// Batch USD prices. Mints without a price map to 0.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_prices(&self, mints: &[Pubkey]) -> Result<HashMap<Pubkey, f64>>;
}

pub fn http_client(config: &ApiConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_seconds))
        .build()
        .context("Failed to build HTTP client")
}

/// Map an HTTP status onto the error taxonomy. 429 is a rate limit, 5xx is
/// transient, any other non-success status is a payload we cannot use.
pub(crate) async fn check_status(source: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let err = if status == StatusCode::TOO_MANY_REQUESTS {
        ReloadError::RateLimited(source.to_string())
    } else if status.is_server_error() {
        ReloadError::Transient(format!("{} responded with {}", source, status))
    } else {
        ReloadError::malformed(source, format!("status {}: {}", status, truncate(&body, 200)))
    };
    Err(err.into())
}

pub(crate) async fn read_json(source: &str, response: Response) -> Result<Value> {
    let text = response
        .text()
        .await
        .map_err(|e| ReloadError::Transient(format!("{} body: {}", source, e)))?;
    serde_json::from_str(&text).map_err(|e| ReloadError::malformed(source, e.to_string()).into())
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Solana Tracker data API (`GET {base}/tokens/{mint}`).
pub struct SolanaTrackerClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl SolanaTrackerClient {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn from_config(http: Client, config: &ApiConfig) -> Self {
        Self::new(http, &config.metadata_base_url, config.metadata_api_key.clone())
    }
}

#[async_trait]
impl MetadataSource for SolanaTrackerClient {
    #[instrument(skip(self))]
    async fn fetch_metadata(&self, mint: &str) -> Result<TokenMetadata> {
        let url = format!("{}/tokens/{}", self.base_url, mint);
        let mut request = self.http.get(&url).header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReloadError::Transient(format!("metadata request: {}", e)))?;
        let response = check_status("metadata", response).await?;
        let body = read_json("metadata", response).await?;

        debug!("Fetched metadata for {}", mint);
        parse_metadata(mint, &body)
    }
}

/// Normalize a metadata payload. Fields may sit at the top level or under a
/// `token` object; absent fields take the defaults.
pub fn parse_metadata(mint: &str, body: &Value) -> Result<TokenMetadata> {
    if !body.is_object() {
        return Err(ReloadError::malformed("metadata", "expected a JSON object").into());
    }
    let token = body.get("token").filter(|t| t.is_object()).unwrap_or(body);

    let text = |key: &str| {
        token
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let decimals = token
        .get("decimals")
        .and_then(Value::as_u64)
        .and_then(|d| u8::try_from(d).ok())
        .filter(|d| *d > 0)
        .unwrap_or(DEFAULT_TOKEN_DECIMALS);

    let price_usd = body
        .get("price")
        .or_else(|| token.get("price"))
        .and_then(price_value)
        .unwrap_or(0.0);

    Ok(TokenMetadata {
        mint: mint.to_string(),
        name: text("name").unwrap_or_else(|| DEFAULT_TOKEN_NAME.to_string()),
        symbol: text("symbol").unwrap_or_else(|| DEFAULT_TOKEN_SYMBOL.to_string()),
        logo_uri: text("image").or_else(|| text("logoURI")),
        decimals,
        price_usd,
    })
}

/// A price given as a number or a decimal string. Anything else, including
/// negative or non-finite values, is treated as no price.
fn price_value(value: &Value) -> Option<f64> {
    let price = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Object(map) => return map.get("usd").and_then(price_value),
        _ => return None,
    };
    (price.is_finite() && price >= 0.0).then_some(price)
}

/// Jupiter price API (`GET {url}?ids=a,b,c`).
pub struct JupiterPriceClient {
    http: Client,
    url: String,
}

impl JupiterPriceClient {
    pub fn new(http: Client, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }

    pub fn from_config(http: Client, config: &ApiConfig) -> Self {
        Self::new(http, &config.price_url)
    }
}

#[async_trait]
impl PriceSource for JupiterPriceClient {
    #[instrument(skip(self, mints), fields(count = mints.len()))]
    async fn fetch_prices(&self, mints: &[Pubkey]) -> Result<HashMap<Pubkey, f64>> {
        if mints.is_empty() {
            return Ok(HashMap::new());
        }

        let ids = mints.join(",");
        let response = self
            .http
            .get(&self.url)
            .query(&[("ids", ids.as_str())])
            .send()
            .await
            .map_err(|e| ReloadError::Transient(format!("price request: {}", e)))?;
        let response = check_status("price", response).await?;
        let body = read_json("price", response).await?;

        parse_prices(mints, &body)
    }
}

/// Pull `data.<mint>.price` for each requested mint. Null entries, missing
/// entries and unparseable prices become 0.
pub fn parse_prices(mints: &[Pubkey], body: &Value) -> Result<HashMap<Pubkey, f64>> {
    let data = body
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| ReloadError::malformed("price", "missing data object"))?;

    Ok(mints
        .iter()
        .map(|mint| {
            let price = data
                .get(mint)
                .and_then(|entry| entry.get("price"))
                .and_then(price_value)
                .unwrap_or(0.0);
            (mint.clone(), price)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_defaults() {
        let meta = parse_metadata("MintA", &json!({})).unwrap();
        assert_eq!(meta.name, "Unknown Token");
        assert_eq!(meta.symbol, "UNKNOWN");
        assert_eq!(meta.decimals, 9);
        assert_eq!(meta.price_usd, 0.0);
        assert!(meta.logo_uri.is_none());
    }

    #[test]
    fn test_metadata_nested_token() {
        let body = json!({
            "token": {
                "name": "Bonk",
                "symbol": "BONK",
                "decimals": 5,
                "image": "https://example.invalid/bonk.png"
            },
            "pools": [],
            "price": {"usd": 0.00002}
        });
        let meta = parse_metadata("MintB", &body).unwrap();
        assert_eq!(meta.symbol, "BONK");
        assert_eq!(meta.decimals, 5);
        assert_eq!(meta.logo_uri.as_deref(), Some("https://example.invalid/bonk.png"));
        assert!((meta.price_usd - 0.00002).abs() < 1e-12);
    }

    #[test]
    fn test_metadata_rejects_non_object() {
        let err = parse_metadata("MintA", &json!([1, 2])).unwrap_err();
        assert!(!crate::error::is_retryable(&err));
    }

    #[test]
    fn test_null_and_missing_prices_become_zero() {
        let mints = vec!["A".to_string(), "B".to_string(), "C".to_string(), "D".to_string()];
        let body = json!({
            "data": {
                "A": {"id": "A", "price": "1.25"},
                "B": null,
                "C": {"id": "C", "price": "not a number"}
            }
        });

        let prices = parse_prices(&mints, &body).unwrap();
        assert_eq!(prices["A"], 1.25);
        assert_eq!(prices["B"], 0.0);
        assert_eq!(prices["C"], 0.0);
        assert_eq!(prices["D"], 0.0);
    }

    #[test]
    fn test_price_payload_without_data_is_malformed() {
        let err = parse_prices(&["A".to_string()], &json!({"error": "bad"})).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReloadError>(),
            Some(ReloadError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
