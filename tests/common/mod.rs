//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use reloadsol::error::ReloadError;
use reloadsol::pipeline::preparer::{unsigned_transaction, PrepareContext, TransactionPreparer};
use reloadsol::pipeline::{LedgerClient, MetadataSource, PriceSource, WalletSigner};
use reloadsol::types::{Pubkey, SwapJob, TokenHolding, TokenMetadata};
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey as SolanaPubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::VersionedTransaction;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn holding(mint: &str, raw_balance: u64) -> TokenHolding {
    TokenHolding {
        mint: mint.to_string(),
        owner_token_account: format!("{}-ata", mint),
        raw_balance,
        decimals: 6,
    }
}

pub fn metadata(mint: &str, price_usd: f64) -> TokenMetadata {
    TokenMetadata {
        mint: mint.to_string(),
        name: format!("Token {}", mint),
        symbol: mint.to_uppercase(),
        logo_uri: None,
        decimals: 6,
        price_usd,
    }
}

/// In-memory ledger that counts every call.
pub struct MockLedger {
    pub holdings: Vec<TokenHolding>,
    pub calls: AtomicUsize,
    pub enumerations: AtomicUsize,
    pub sent: AtomicUsize,
    /// Signatures that never reach the confirmed state
    pub never_confirm: bool,
    /// Signature statuses report this on-chain error
    pub on_chain_error: Option<String>,
    /// Status queries never return
    pub hang_status: bool,
}

impl MockLedger {
    pub fn new(holdings: Vec<TokenHolding>) -> Self {
        Self {
            holdings,
            calls: AtomicUsize::new(0),
            enumerations: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
            never_confirm: false,
            on_chain_error: None,
            hang_status: false,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn token_accounts_by_owner(&self, _owner: &str) -> Result<Vec<TokenHolding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        Ok(self.holdings.clone())
    }

    async fn latest_blockhash(&self) -> Result<Hash> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Hash::new_unique())
    }

    async fn send_transaction(&self, _tx: &VersionedTransaction) -> Result<Signature> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(Signature::new_unique())
    }

    async fn signature_status(&self, _signature: &Signature) -> Result<Option<Result<(), String>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_status {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = &self.on_chain_error {
            return Ok(Some(Err(reason.clone())));
        }
        if self.never_confirm {
            Ok(None)
        } else {
            Ok(Some(Ok(())))
        }
    }
}

/// Keypair-backed signer that records batch sizes.
pub struct MockSigner {
    keypair: Option<Keypair>,
    pub batches: Mutex<Vec<usize>>,
    pub reject: bool,
}

impl MockSigner {
    pub fn connected() -> Self {
        Self {
            keypair: Some(Keypair::new()),
            batches: Mutex::new(Vec::new()),
            reject: false,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            keypair: None,
            batches: Mutex::new(Vec::new()),
            reject: false,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::connected()
        }
    }

    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl WalletSigner for MockSigner {
    fn pubkey(&self) -> Option<SolanaPubkey> {
        self.keypair.as_ref().map(|k| k.pubkey())
    }

    async fn sign_transaction(&self, tx: VersionedTransaction) -> Result<VersionedTransaction> {
        let Some(keypair) = &self.keypair else {
            bail!(ReloadError::WalletNotConnected);
        };
        Ok(VersionedTransaction::try_new(tx.message, &[keypair])?)
    }

    async fn sign_all(&self, txs: Vec<VersionedTransaction>) -> Result<Vec<VersionedTransaction>> {
        self.batches.lock().unwrap().push(txs.len());
        if self.reject {
            bail!("user rejected the request");
        }
        let mut signed = Vec::with_capacity(txs.len());
        for tx in txs {
            signed.push(self.sign_transaction(tx).await?);
        }
        Ok(signed)
    }
}

/// Builds an empty transaction per job; configured mints fail or stall.
#[derive(Default)]
pub struct ScriptedPreparer {
    pub failing: HashSet<Pubkey>,
    pub stalling: HashSet<Pubkey>,
    pub prepared: AtomicUsize,
}

impl ScriptedPreparer {
    pub fn failing(mints: &[&str]) -> Self {
        Self {
            failing: mints.iter().map(|m| m.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn stalling(mints: &[&str]) -> Self {
        Self {
            stalling: mints.iter().map(|m| m.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl TransactionPreparer for ScriptedPreparer {
    async fn prepare(&self, job: &SwapJob, ctx: &PrepareContext) -> Result<VersionedTransaction> {
        if self.failing.contains(&job.mint) {
            bail!("swap API returned 500 for {}", job.mint);
        }
        if self.stalling.contains(&job.mint) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.prepared.fetch_add(1, Ordering::SeqCst);
        unsigned_transaction(&ctx.payer, &[], ctx.blockhash)
    }
}

/// Metadata source with per-mint behaviour and call counting.
#[derive(Default)]
pub struct MockMetadata {
    pub prices: HashMap<Pubkey, f64>,
    pub transient: HashSet<Pubkey>,
    pub malformed: HashSet<Pubkey>,
    pub calls: Mutex<HashMap<Pubkey, usize>>,
}

impl MockMetadata {
    pub fn calls(&self, mint: &str) -> usize {
        self.calls.lock().unwrap().get(mint).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MetadataSource for MockMetadata {
    async fn fetch_metadata(&self, mint: &str) -> Result<TokenMetadata> {
        *self.calls.lock().unwrap().entry(mint.to_string()).or_default() += 1;
        if self.transient.contains(mint) {
            return Err(ReloadError::Transient("503 Service Unavailable".into()).into());
        }
        if self.malformed.contains(mint) {
            return Err(ReloadError::malformed("metadata", "unexpected token").into());
        }
        Ok(metadata(mint, self.prices.get(mint).copied().unwrap_or(0.0)))
    }
}

/// Price source returning a fixed table; unknown mints are absent.
#[derive(Default)]
pub struct MockPrices {
    pub table: HashMap<Pubkey, f64>,
    pub batches: Mutex<Vec<usize>>,
    pub called_at: Mutex<Vec<tokio::time::Instant>>,
}

#[async_trait]
impl PriceSource for MockPrices {
    async fn fetch_prices(&self, mints: &[Pubkey]) -> Result<HashMap<Pubkey, f64>> {
        self.batches.lock().unwrap().push(mints.len());
        self.called_at.lock().unwrap().push(tokio::time::Instant::now());
        Ok(mints
            .iter()
            .filter_map(|m| self.table.get(m).map(|p| (m.clone(), *p)))
            .collect())
    }
}
