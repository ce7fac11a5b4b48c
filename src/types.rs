//! Core types and data structures for the ReloadSOL sweep pipeline.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// A base58 address kept as a string; parsed into a `solana_sdk` key only at the RPC edge.
pub type Pubkey = String;

/// Native SOL (wrapped) mint, the default swap output.
pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// One SPL token account owned by the wallet, as observed at fetch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHolding {
    /// The mint address of the token
    pub mint: Pubkey,
    /// The token account holding the balance
    pub owner_token_account: Pubkey,
    /// Balance in base units
    #[serde(deserialize_with = "deserialize_amount")]
    pub raw_balance: u64,
    /// Mint decimals
    pub decimals: u8,
}

impl TokenHolding {
    pub fn is_empty(&self) -> bool {
        self.raw_balance == 0
    }

    /// Balance in whole tokens.
    pub fn ui_amount(&self) -> f64 {
        self.raw_balance as f64 / 10f64.powi(self.decimals as i32)
    }

    /// USD value of the balance at the given unit price.
    pub fn usd_value(&self, price_usd: f64) -> f64 {
        self.ui_amount() * price_usd
    }

    /// Fixed-point rendering with four fractional digits, computed on integers.
    pub fn format_balance(&self) -> String {
        let digits = self.raw_balance.to_string();
        let decimals = self.decimals as usize;
        let padded = format!("{:0>width$}", digits, width = decimals + 1);
        let split = padded.len() - decimals;
        let (whole, frac) = padded.split_at(split);
        let frac: String = frac.chars().take(4).collect();
        format!("{}.{:0<4}", whole, frac)
    }
}

/// Accepts balances written either as JSON integers or as decimal strings.
///
/// Older snapshots stored balances as strings; new writes use plain integers.
pub fn deserialize_amount<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Amount {
        Number(u64),
        Text(String),
    }

    match Amount::deserialize(deserializer)? {
        Amount::Number(n) => Ok(n),
        Amount::Text(s) => s.trim().parse::<u64>().map_err(serde::de::Error::custom),
    }
}

/// Token metadata merged from the metadata and price services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub mint: Pubkey,
    pub name: String,
    pub symbol: String,
    pub logo_uri: Option<String>,
    pub decimals: u8,
    /// Unit price in USD, 0 when the upstream has no price
    pub price_usd: f64,
}

/// What to do with a selected holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobAction {
    /// Swap the balance into `desired_output_mint` through the aggregator
    Swap,
    /// Close an empty token account and reclaim its rent
    Close,
    /// Burn the full balance
    Burn,
    /// Swap, falling back to a burn when no route is available
    SwapOrBurn,
    /// Transfer `amount_base_units` lamports to the fee recipient
    ServiceFee,
}

/// A unit of work for the submitter. Lives for one batch only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapJob {
    pub mint: Pubkey,
    /// Token account, required for close and burn
    pub token_account: Option<Pubkey>,
    pub amount_base_units: u64,
    pub decimals: u8,
    pub desired_output_mint: Pubkey,
    pub action: JobAction,
}

impl SwapJob {
    /// Swap the whole holding into wrapped SOL.
    pub fn swap_to_sol(holding: &TokenHolding) -> Self {
        Self::for_holding(holding, JobAction::Swap)
    }

    /// Close the (empty) token account behind the holding.
    pub fn close(holding: &TokenHolding) -> Self {
        Self::for_holding(holding, JobAction::Close)
    }

    /// Service fee for a sweep, paid in lamports.
    pub fn service_fee(lamports: u64) -> Self {
        Self {
            mint: WRAPPED_SOL_MINT.to_string(),
            token_account: None,
            amount_base_units: lamports,
            decimals: 9,
            desired_output_mint: WRAPPED_SOL_MINT.to_string(),
            action: JobAction::ServiceFee,
        }
    }

    pub fn for_holding(holding: &TokenHolding, action: JobAction) -> Self {
        Self {
            mint: holding.mint.clone(),
            token_account: Some(holding.owner_token_account.clone()),
            amount_base_units: holding.raw_balance,
            decimals: holding.decimals,
            desired_output_mint: WRAPPED_SOL_MINT.to_string(),
            action,
        }
    }
}

/// Terminal or in-flight status of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Furthest stage a job reached before its terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobStage {
    Created,
    Prepared,
    Signed,
    Sent,
}

/// Outcome for one job in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapResult {
    pub mint: Pubkey,
    pub signature: Option<String>,
    pub status: SwapStatus,
    pub stage: JobStage,
    pub error: Option<String>,
}

impl SwapResult {
    pub fn created(mint: &str) -> Self {
        Self {
            mint: mint.to_string(),
            signature: None,
            status: SwapStatus::Pending,
            stage: JobStage::Created,
            error: None,
        }
    }

    pub fn fail(&mut self, reason: impl fmt::Display) {
        self.status = SwapStatus::Failed;
        self.error = Some(reason.to_string());
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SwapStatus::Confirmed | SwapStatus::Failed)
    }
}

/// Aggregated outcome of one `submit` call. Results are in job order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<SwapResult>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn from_results(results: Vec<SwapResult>) -> Self {
        let succeeded = results
            .iter()
            .filter(|r| r.status == SwapStatus::Confirmed)
            .count();
        let failed = results
            .iter()
            .filter(|r| r.status == SwapStatus::Failed)
            .count();
        Self {
            results,
            succeeded,
            failed,
        }
    }

    /// Mints that did not confirm, for a caller-driven retry.
    pub fn failed_mints(&self) -> Vec<Pubkey> {
        self.results
            .iter()
            .filter(|r| r.status != SwapStatus::Confirmed)
            .map(|r| r.mint.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holding(raw_balance: u64, decimals: u8) -> TokenHolding {
        TokenHolding {
            mint: "Mint".to_string(),
            owner_token_account: "Account".to_string(),
            raw_balance,
            decimals,
        }
    }

    #[test]
    fn test_format_balance() {
        assert_eq!(holding(1_500_000_000, 9).format_balance(), "1.5000");
        assert_eq!(holding(5, 9).format_balance(), "0.0000");
        assert_eq!(holding(123_456, 2).format_balance(), "1234.5600");
        assert_eq!(holding(42, 0).format_balance(), "42.0000");
    }

    #[test]
    fn test_usd_value() {
        let h = holding(2_000_000, 6);
        assert!((h.usd_value(0.25) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_amount_accepts_string_and_number() {
        let from_number: TokenHolding = serde_json::from_str(
            r#"{"mint":"M","owner_token_account":"A","raw_balance":18446744073709551615,"decimals":0}"#,
        )
        .unwrap();
        let from_text: TokenHolding = serde_json::from_str(
            r#"{"mint":"M","owner_token_account":"A","raw_balance":"18446744073709551615","decimals":0}"#,
        )
        .unwrap();
        assert_eq!(from_number.raw_balance, u64::MAX);
        assert_eq!(from_text.raw_balance, u64::MAX);
    }

    #[test]
    fn test_batch_report_counts() {
        let mut ok = SwapResult::created("A");
        ok.status = SwapStatus::Confirmed;
        let mut bad = SwapResult::created("B");
        bad.fail("boom");

        let report = BatchReport::from_results(vec![ok, bad]);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failed_mints(), vec!["B".to_string()]);
    }
}
