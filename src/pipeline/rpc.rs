//! Solana JSON-RPC access with endpoint fallback.

use crate::error::{looks_rate_limited, ReloadError};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::types::RpcConfig;
use crate::types::TokenHolding;
use anyhow::{Context, Result};
use async_trait::async_trait;
use nonempty::NonEmpty;
use serde_json::Value;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_client::rpc_request::TokenAccountsFilter;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey as SolanaPubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

/// Classic SPL Token program.
pub const TOKEN_PROGRAM_ID: SolanaPubkey =
    solana_sdk::pubkey!("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");

/// On-chain reads and writes needed by the pipeline.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Every SPL token account owned by `owner`, parsed. Accounts whose data
    /// cannot be read are skipped.
    async fn token_accounts_by_owner(&self, owner: &str) -> Result<Vec<TokenHolding>>;

    async fn latest_blockhash(&self) -> Result<Hash>;

    async fn send_transaction(&self, tx: &VersionedTransaction) -> Result<Signature>;

    /// `None` while the signature is not yet confirmed, otherwise the on-chain
    /// outcome.
    async fn signature_status(&self, signature: &Signature) -> Result<Option<Result<(), String>>>;

    /// Poll `signature_status` until it settles or `timeout` passes.
    async fn confirm_transaction(
        &self,
        signature: &Signature,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.signature_status(signature).await {
                Ok(Some(Ok(()))) => return Ok(()),
                Ok(Some(Err(reason))) => {
                    return Err(ReloadError::ConfirmationFailed(reason).into());
                }
                Ok(None) => {}
                Err(e) => debug!("Status poll for {} failed: {:#}", signature, e),
            }

            if Instant::now() + poll_interval > deadline {
                return Err(ReloadError::Timeout(format!(
                    "{} not confirmed within {:?}",
                    signature, timeout
                ))
                .into());
            }
            sleep(poll_interval).await;
        }
    }
}

/// Round-robin over RPC endpoints, moving on when the current one reports a
/// rate limit.
pub struct RpcManager<C = RpcClient> {
    clients: NonEmpty<Arc<C>>,
    current: AtomicUsize,
    max_switches: usize,
}

impl RpcManager<RpcClient> {
    pub fn new(config: &RpcConfig) -> Self {
        let mut urls = NonEmpty::new(config.primary_url.clone());
        if let Some(fallback) = &config.fallback_url {
            urls.push(fallback.clone());
        }

        let clients = urls.map(|url| {
            Arc::new(RpcClient::new_with_timeout(
                url,
                Duration::from_secs(config.timeout_seconds),
            ))
        });

        info!("RPC manager created with {} endpoints", clients.len());
        Self::from_clients(clients, config.max_switches)
    }
}

impl<C> RpcManager<C> {
    pub fn from_clients(clients: NonEmpty<Arc<C>>, max_switches: usize) -> Self {
        Self {
            clients,
            current: AtomicUsize::new(0),
            max_switches: max_switches.max(1),
        }
    }

    pub fn current(&self) -> Arc<C> {
        let index = self.current.load(Ordering::Acquire) % self.clients.len();
        self.clients[index].clone()
    }

    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::Acquire) % self.clients.len()
    }

    // Only the caller that observed `from` moves the index.
    fn switch_from(&self, from: usize) {
        let next = (from + 1) % self.clients.len();
        if self
            .current
            .compare_exchange(from, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            warn!("Switching RPC endpoint {} -> {}", from, next);
        }
    }

    /// Run `op` against the current endpoint, switching endpoints on rate
    /// limit errors. Other errors are returned as they are.
    pub async fn execute<F, Fut, T, E>(&self, label: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<C>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        for attempt in 1..=self.max_switches {
            let index = self.current_index();
            match op(self.clients[index].clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if looks_rate_limited(&e.to_string()) => {
                    warn!("{} rate limited on endpoint {} (attempt {})", label, index, attempt);
                    if self.clients.len() > 1 {
                        self.switch_from(index);
                    }
                }
                Err(e) => return Err(anyhow::Error::new(e).context(label.to_string())),
            }
        }

        Err(ReloadError::RateLimited(format!("{} on every RPC endpoint", label)).into())
    }
}

/// `LedgerClient` over live Solana RPC.
pub struct SolanaLedger {
    rpc: RpcManager,
    retry: RetryPolicy,
    commitment: CommitmentConfig,
}

impl SolanaLedger {
    pub fn new(config: &RpcConfig, retry: RetryPolicy) -> Self {
        Self {
            rpc: RpcManager::new(config),
            retry,
            commitment: CommitmentConfig::confirmed(),
        }
    }
}

#[async_trait]
impl LedgerClient for SolanaLedger {
    #[instrument(skip(self))]
    async fn token_accounts_by_owner(&self, owner: &str) -> Result<Vec<TokenHolding>> {
        let owner_key = parse_address(owner)?;

        let accounts = self
            .retry
            .run("getTokenAccountsByOwner", || {
                self.rpc.execute("getTokenAccountsByOwner", |client| async move {
                    client
                        .get_token_accounts_by_owner(
                            &owner_key,
                            TokenAccountsFilter::ProgramId(TOKEN_PROGRAM_ID),
                        )
                        .await
                })
            })
            .await?;

        let mut holdings = Vec::with_capacity(accounts.len());
        for keyed in accounts {
            let data = serde_json::to_value(&keyed.account.data)
                .context("Failed to re-encode account data")?;
            match parse_token_account(&keyed.pubkey, &data) {
                Some(holding) => holdings.push(holding),
                None => warn!("Skipping token account {} with unreadable data", keyed.pubkey),
            }
        }

        debug!("Owner {} has {} token accounts", owner, holdings.len());
        Ok(holdings)
    }

    async fn latest_blockhash(&self) -> Result<Hash> {
        let commitment = self.commitment;
        let (hash, _last_valid_height) = self
            .retry
            .run("getLatestBlockhash", || {
                self.rpc.execute("getLatestBlockhash", |client| async move {
                    client.get_latest_blockhash_with_commitment(commitment).await
                })
            })
            .await?;
        Ok(hash)
    }

    #[instrument(skip(self, tx))]
    async fn send_transaction(&self, tx: &VersionedTransaction) -> Result<Signature> {
        self.rpc
            .execute("sendTransaction", |client| async move {
                let config = RpcSendTransactionConfig {
                    skip_preflight: true,
                    max_retries: Some(3),
                    ..Default::default()
                };
                client.send_transaction_with_config(tx, config).await
            })
            .await
    }

    async fn signature_status(&self, signature: &Signature) -> Result<Option<Result<(), String>>> {
        let commitment = self.commitment;
        let response = self
            .rpc
            .execute("getSignatureStatuses", |client| async move {
                client.get_signature_statuses(&[*signature]).await
            })
            .await?;

        let status = response.value.into_iter().next().flatten();
        Ok(status.and_then(|status| match status.err {
            Some(err) => Some(Err(err.to_string())),
            None if status.satisfies_commitment(commitment) => Some(Ok(())),
            None => None,
        }))
    }
}

/// Parse a base58 address.
pub fn parse_address(address: &str) -> Result<SolanaPubkey> {
    SolanaPubkey::from_str(address)
        .map_err(|e| ReloadError::InvalidAddress(format!("{}: {}", address, e)).into())
}

/// Read a `jsonParsed` SPL token account.
///
/// `amount` arrives as a decimal string and is parsed straight into `u64`.
pub fn parse_token_account(account: &str, data: &Value) -> Option<TokenHolding> {
    let info = data.pointer("/parsed/info")?;
    let mint = info.get("mint")?.as_str()?;
    let token_amount = info.get("tokenAmount")?;
    let raw_balance = match token_amount.get("amount")? {
        Value::String(s) => s.parse::<u64>().ok()?,
        Value::Number(n) => n.as_u64()?,
        _ => return None,
    };
    let decimals = u8::try_from(token_amount.get("decimals")?.as_u64()?).ok()?;

    Some(TokenHolding {
        mint: mint.to_string(),
        owner_token_account: account.to_string(),
        raw_balance,
        decimals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_parse_token_account() {
        let data = json!({
            "program": "spl-token",
            "parsed": {
                "type": "account",
                "info": {
                    "mint": "MintA",
                    "owner": "Owner",
                    "tokenAmount": {
                        "amount": "18446744073709551615",
                        "decimals": 6,
                        "uiAmount": 1.8e13,
                        "uiAmountString": "18446744073709.551615"
                    }
                }
            },
            "space": 165
        });

        let holding = parse_token_account("AccountA", &data).unwrap();
        assert_eq!(holding.mint, "MintA");
        assert_eq!(holding.owner_token_account, "AccountA");
        assert_eq!(holding.raw_balance, u64::MAX);
        assert_eq!(holding.decimals, 6);
    }

    #[test]
    fn test_parse_token_account_rejects_binary_data() {
        let data = json!(["AAAA", "base64"]);
        assert!(parse_token_account("AccountA", &data).is_none());

        let bad_amount = json!({"parsed": {"info": {"mint": "M", "tokenAmount": {"amount": "-1", "decimals": 0}}}});
        assert!(parse_token_account("AccountA", &bad_amount).is_none());
    }

    #[test]
    fn test_parse_address() {
        assert!(parse_address("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA").is_ok());
        let err = parse_address("not-an-address").unwrap_err();
        assert!(matches!(err.downcast_ref::<ReloadError>(), Some(ReloadError::InvalidAddress(_))));
    }

    fn manager(names: &[&str]) -> RpcManager<String> {
        let mut clients = NonEmpty::new(Arc::new(names[0].to_string()));
        for name in &names[1..] {
            clients.push(Arc::new(name.to_string()));
        }
        RpcManager::from_clients(clients, 3)
    }

    #[tokio::test]
    async fn test_switches_endpoint_on_rate_limit() {
        let rpc = manager(&["primary", "fallback"]);

        let used = rpc
            .execute("test", |client| async move {
                if client.as_str() == "primary" {
                    Err(io::Error::new(io::ErrorKind::Other, "HTTP 429 Too Many Requests"))
                } else {
                    Ok(client.to_string())
                }
            })
            .await
            .unwrap();

        assert_eq!(used, "fallback");
        assert_eq!(rpc.current_index(), 1);
    }

    #[tokio::test]
    async fn test_other_errors_do_not_switch() {
        let rpc = manager(&["primary", "fallback"]);

        let result: Result<()> = rpc
            .execute("test", |_client| async move {
                Err(io::Error::new(io::ErrorKind::Other, "account not found"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(rpc.current_index(), 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_switches() {
        let rpc = manager(&["primary", "fallback"]);
        let calls = AtomicU32::new(0);

        let result: Result<()> = rpc
            .execute("test", |_client| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(io::Error::new(io::ErrorKind::Other, "rate limit exceeded")) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err.downcast_ref::<ReloadError>(), Some(ReloadError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct PendingLedger {
        polls: AtomicU32,
        settle_after: u32,
        outcome: Result<(), String>,
    }

    #[async_trait]
    impl LedgerClient for PendingLedger {
        async fn token_accounts_by_owner(&self, _owner: &str) -> Result<Vec<TokenHolding>> {
            Ok(Vec::new())
        }

        async fn latest_blockhash(&self) -> Result<Hash> {
            Ok(Hash::default())
        }

        async fn send_transaction(&self, _tx: &VersionedTransaction) -> Result<Signature> {
            Ok(Signature::default())
        }

        async fn signature_status(&self, _sig: &Signature) -> Result<Option<Result<(), String>>> {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if polls >= self.settle_after {
                Ok(Some(self.outcome.clone()))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_polls_until_settled() {
        let ledger = PendingLedger {
            polls: AtomicU32::new(0),
            settle_after: 3,
            outcome: Ok(()),
        };
        ledger
            .confirm_transaction(&Signature::default(), Duration::from_secs(10), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ledger.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_reports_on_chain_error() {
        let ledger = PendingLedger {
            polls: AtomicU32::new(0),
            settle_after: 1,
            outcome: Err("InstructionError".to_string()),
        };
        let err = ledger
            .confirm_transaction(&Signature::default(), Duration::from_secs(10), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReloadError>(),
            Some(ReloadError::ConfirmationFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_times_out() {
        let ledger = PendingLedger {
            polls: AtomicU32::new(0),
            settle_after: u32::MAX,
            outcome: Ok(()),
        };
        let err = ledger
            .confirm_transaction(&Signature::default(), Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<ReloadError>(), Some(ReloadError::Timeout(_))));
    }
}
