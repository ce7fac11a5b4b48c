//! Wallet token account enumeration.

use crate::pipeline::cache::PersistentCache;
use crate::pipeline::rpc::LedgerClient;
use crate::pipeline::types::TokenListSnapshot;
use crate::types::{Pubkey, TokenHolding, TokenMetadata};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Cache namespace of the per-owner token list snapshot.
pub const SNAPSHOT_NAMESPACE: &str = "last_known_tokens";

/// A wallet's token accounts split on balance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enumeration {
    pub zero_balance: Vec<TokenHolding>,
    pub non_zero_balance: Vec<TokenHolding>,
}

impl Enumeration {
    pub fn total(&self) -> usize {
        self.zero_balance.len() + self.non_zero_balance.len()
    }

    pub fn mints(&self) -> Vec<Pubkey> {
        self.zero_balance
            .iter()
            .chain(&self.non_zero_balance)
            .map(|h| h.mint.clone())
            .collect()
    }

    fn into_snapshot(self, owner: &str) -> TokenListSnapshot {
        TokenListSnapshot {
            owner: owner.to_string(),
            zero_balance: self.zero_balance,
            non_zero_balance: self.non_zero_balance,
        }
    }
}

impl From<TokenListSnapshot> for Enumeration {
    fn from(snapshot: TokenListSnapshot) -> Self {
        Self {
            zero_balance: snapshot.zero_balance,
            non_zero_balance: snapshot.non_zero_balance,
        }
    }
}

pub struct TokenEnumerator {
    ledger: Arc<dyn LedgerClient>,
    denylist: HashSet<Pubkey>,
    snapshots: Arc<PersistentCache<TokenListSnapshot>>,
}

impl TokenEnumerator {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        denylist: impl IntoIterator<Item = Pubkey>,
        snapshots: Arc<PersistentCache<TokenListSnapshot>>,
    ) -> Self {
        Self {
            ledger,
            denylist: denylist.into_iter().collect(),
            snapshots,
        }
    }

    /// Fetch every token account of `owner` in one bulk call, drop denylisted
    /// mints, and split on `raw_balance == 0`.
    #[instrument(skip(self))]
    pub async fn enumerate(&self, owner: &str) -> Result<Enumeration> {
        let holdings = self.ledger.token_accounts_by_owner(owner).await?;

        let mut result = Enumeration::default();
        let mut skipped = 0;
        for holding in holdings {
            if self.denylist.contains(&holding.mint) {
                skipped += 1;
                continue;
            }
            if holding.is_empty() {
                result.zero_balance.push(holding);
            } else {
                result.non_zero_balance.push(holding);
            }
        }

        info!(
            "Owner {} holds {} empty and {} funded token accounts ({} denylisted)",
            owner,
            result.zero_balance.len(),
            result.non_zero_balance.len(),
            skipped
        );
        Ok(result)
    }

    /// Serve the last-known snapshot while it is fresh, otherwise enumerate
    /// and store a new one.
    pub async fn enumerate_cached(&self, owner: &str) -> Result<Enumeration> {
        if let Some(snapshot) = self.snapshots.get(owner).await {
            if snapshot.owner == owner {
                debug!("Using cached token list for {}", owner);
                return Ok(snapshot.into());
            }
            warn!("Snapshot under {} belongs to {}, ignoring", owner, snapshot.owner);
        }

        let enumeration = self.enumerate(owner).await?;
        if let Err(e) = self
            .snapshots
            .put(owner, enumeration.clone().into_snapshot(owner))
            .await
        {
            warn!("Failed to store token list snapshot for {}: {:#}", owner, e);
        }
        Ok(enumeration)
    }

    /// Drop the stored snapshot for `owner`.
    pub async fn forget(&self, owner: &str) -> Result<()> {
        self.snapshots.remove(owner).await
    }
}

/// Funded holdings worth less than `threshold_usd`. Holdings without metadata
/// are never dust.
pub fn dust(
    holdings: &[TokenHolding],
    metadata: &HashMap<Pubkey, Option<TokenMetadata>>,
    threshold_usd: f64,
) -> Vec<TokenHolding> {
    holdings
        .iter()
        .filter(|h| !h.is_empty())
        .filter(|h| match metadata.get(&h.mint) {
            Some(Some(meta)) => h.usd_value(meta.price_usd) < threshold_usd,
            _ => false,
        })
        .cloned()
        .collect()
}
