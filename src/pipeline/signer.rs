//! Wallet signing seam.

use crate::error::ReloadError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey as SolanaPubkey;
use solana_sdk::signature::{read_keypair_file, Keypair, Signer};
use solana_sdk::transaction::VersionedTransaction;
use std::path::Path;
use tracing::info;

/// Anything that can sign on behalf of the wallet owner.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    /// `None` when no wallet is connected.
    fn pubkey(&self) -> Option<SolanaPubkey>;

    async fn sign_transaction(&self, tx: VersionedTransaction) -> Result<VersionedTransaction>;

    /// Sign a whole batch. The output has the same length and order as the
    /// input; any failure rejects the batch.
    async fn sign_all(&self, txs: Vec<VersionedTransaction>) -> Result<Vec<VersionedTransaction>> {
        let mut signed = Vec::with_capacity(txs.len());
        for tx in txs {
            signed.push(self.sign_transaction(tx).await?);
        }
        Ok(signed)
    }
}

/// Signs with a local keypair.
pub struct KeypairSigner {
    keypair: Keypair,
}

impl KeypairSigner {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    /// Load a Solana CLI keypair file (JSON array of 64 bytes).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let keypair = read_keypair_file(path)
            .map_err(|e| anyhow!("Failed to read keypair {}: {}", path.display(), e))?;
        info!("Loaded signer {}", keypair.pubkey());
        Ok(Self::new(keypair))
    }
}

#[async_trait]
impl WalletSigner for KeypairSigner {
    fn pubkey(&self) -> Option<SolanaPubkey> {
        Some(self.keypair.pubkey())
    }

    async fn sign_transaction(&self, tx: VersionedTransaction) -> Result<VersionedTransaction> {
        VersionedTransaction::try_new(tx.message, &[&self.keypair])
            .map_err(|e| ReloadError::SigningRejected(e.to_string()).into())
    }
}
