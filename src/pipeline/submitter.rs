//! Batch submission: prepare, sign once, send in groups, confirm.

use crate::error::ReloadError;
use crate::pipeline::preparer::{PrepareContext, TransactionPreparer};
use crate::pipeline::rate_limit::RateLimiter;
use crate::pipeline::rpc::LedgerClient;
use crate::pipeline::signer::WalletSigner;
use crate::pipeline::types::SubmitConfig;
use crate::types::{BatchReport, JobStage, SwapJob, SwapResult, SwapStatus};
use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

/// How transactions inside one send group go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    Sequential,
    Concurrent,
}

#[derive(Debug, Clone)]
pub struct SubmitterSettings {
    pub send_group_size: usize,
    pub send_policy: SendPolicy,
    pub prepare_timeout: Duration,
    pub confirm_timeout: Duration,
    pub confirm_poll: Duration,
}

impl Default for SubmitterSettings {
    fn default() -> Self {
        Self::from(&SubmitConfig::default())
    }
}

impl From<&SubmitConfig> for SubmitterSettings {
    fn from(config: &SubmitConfig) -> Self {
        Self {
            send_group_size: config.send_group_size.max(1),
            send_policy: if config.concurrent_sends {
                SendPolicy::Concurrent
            } else {
                SendPolicy::Sequential
            },
            prepare_timeout: Duration::from_millis(config.prepare_timeout_ms),
            confirm_timeout: Duration::from_millis(config.confirm_timeout_ms),
            confirm_poll: Duration::from_millis(config.confirm_poll_ms.max(1)),
        }
    }
}

enum SendOutcome {
    NotSent(String),
    Sent {
        signature: Signature,
        confirmation: Result<(), String>,
    },
}

pub struct Submitter {
    ledger: Arc<dyn LedgerClient>,
    preparer: Arc<dyn TransactionPreparer>,
    limiter: Arc<RateLimiter>,
    settings: SubmitterSettings,
}

impl Submitter {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        preparer: Arc<dyn TransactionPreparer>,
        limiter: Arc<RateLimiter>,
        settings: SubmitterSettings,
    ) -> Self {
        Self {
            ledger,
            preparer,
            limiter,
            settings,
        }
    }

    pub fn settings(&self) -> &SubmitterSettings {
        &self.settings
    }

    /// Submit one transaction per job.
    ///
    /// Per-job failures end up in the report. `Err` is returned only when no
    /// wallet is connected, no blockhash can be fetched, or the wallet
    /// rejects the signing request.
    #[instrument(skip(self, jobs, signer), fields(jobs = jobs.len()))]
    pub async fn submit(&self, jobs: &[SwapJob], signer: &dyn WalletSigner) -> Result<BatchReport> {
        let payer = signer.pubkey().ok_or(ReloadError::WalletNotConnected)?;
        if jobs.is_empty() {
            return Ok(BatchReport::default());
        }

        let blockhash = self.ledger.latest_blockhash().await?;
        let ctx = PrepareContext { payer, blockhash };
        let mut results: Vec<SwapResult> = jobs.iter().map(|job| SwapResult::created(&job.mint)).collect();

        let prepared = self.prepare_all(jobs, &ctx, &mut results).await;

        let (indices, unsigned): (Vec<usize>, Vec<VersionedTransaction>) = prepared
            .into_iter()
            .enumerate()
            .filter_map(|(i, tx)| tx.map(|tx| (i, tx)))
            .unzip();

        if unsigned.is_empty() {
            warn!("No transactions prepared out of {} jobs", jobs.len());
            return Ok(BatchReport::from_results(results));
        }

        let signed = self.sign_batch(signer, unsigned).await?;
        for &i in &indices {
            results[i].stage = JobStage::Signed;
        }

        let outcomes = self.send_all(indices.into_iter().zip(signed).collect()).await;
        for (i, outcome) in outcomes {
            let result = &mut results[i];
            match outcome {
                SendOutcome::NotSent(reason) => result.fail(format!("send failed: {}", reason)),
                SendOutcome::Sent { signature, confirmation } => {
                    result.signature = Some(signature.to_string());
                    result.stage = JobStage::Sent;
                    match confirmation {
                        Ok(()) => result.status = SwapStatus::Confirmed,
                        Err(reason) => result.fail(reason),
                    }
                }
            }
        }

        let report = BatchReport::from_results(results);
        info!(
            "Batch finished: {} confirmed, {} failed of {}",
            report.succeeded,
            report.failed,
            jobs.len()
        );
        Ok(report)
    }

    /// Prepare every job through the limiter until all finish or the batch
    /// deadline passes. Jobs still in flight at the deadline are failed.
    async fn prepare_all(
        &self,
        jobs: &[SwapJob],
        ctx: &PrepareContext,
        results: &mut [SwapResult],
    ) -> Vec<Option<VersionedTransaction>> {
        let mut prepared: Vec<Option<VersionedTransaction>> = (0..jobs.len()).map(|_| None).collect();

        let mut pending: FuturesUnordered<_> = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| async move {
                let outcome = self
                    .limiter
                    .schedule(|| self.preparer.prepare(job, ctx))
                    .await;
                (i, outcome)
            })
            .collect();

        let deadline = sleep_until(Instant::now() + self.settings.prepare_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                next = pending.next() => match next {
                    Some((i, Ok(tx))) => {
                        results[i].stage = JobStage::Prepared;
                        prepared[i] = Some(tx);
                    }
                    Some((i, Err(e))) => {
                        warn!("Preparation failed for {}: {:#}", jobs[i].mint, e);
                        results[i].fail(format!("preparation failed: {:#}", e));
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        "Preparation deadline of {:?} passed with {} jobs outstanding",
                        self.settings.prepare_timeout,
                        pending.len()
                    );
                    break;
                }
            }
        }
        drop(pending);

        for result in results.iter_mut() {
            if result.stage == JobStage::Created && !result.is_terminal() {
                result.fail("preparation deadline exceeded");
            }
        }
        prepared
    }

    async fn sign_batch(
        &self,
        signer: &dyn WalletSigner,
        unsigned: Vec<VersionedTransaction>,
    ) -> Result<Vec<VersionedTransaction>> {
        let expected = unsigned.len();
        debug!("Requesting {} signatures", expected);

        let signed = signer.sign_all(unsigned).await.map_err(|e| {
            error!("Wallet rejected batch: {:#}", e);
            ReloadError::SigningRejected(format!("{:#}", e))
        })?;

        if signed.len() != expected {
            error!("Wallet returned {} of {} transactions", signed.len(), expected);
            return Err(ReloadError::SigningRejected(format!(
                "expected {} signed transactions, got {}",
                expected,
                signed.len()
            ))
            .into());
        }
        Ok(signed)
    }

    /// Send groups concurrently; each group follows the send policy.
    async fn send_all(&self, signed: Vec<(usize, VersionedTransaction)>) -> Vec<(usize, SendOutcome)> {
        let groups: Vec<Vec<(usize, VersionedTransaction)>> = signed
            .chunks(self.settings.send_group_size)
            .map(|group| group.to_vec())
            .collect();
        debug!("Sending {} groups", groups.len());

        let group_tasks = groups.into_iter().map(|group| async move {
            match self.settings.send_policy {
                SendPolicy::Sequential => {
                    let mut outcomes = Vec::with_capacity(group.len());
                    for (i, tx) in group {
                        outcomes.push((i, self.send_one(tx).await));
                    }
                    outcomes
                }
                SendPolicy::Concurrent => {
                    let tasks = group
                        .into_iter()
                        .map(|(i, tx)| async move { (i, self.send_one(tx).await) });
                    futures::future::join_all(tasks).await
                }
            }
        });

        futures::future::join_all(group_tasks)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn send_one(&self, tx: VersionedTransaction) -> SendOutcome {
        let signature = match self.ledger.send_transaction(&tx).await {
            Ok(signature) => signature,
            Err(e) => return SendOutcome::NotSent(format!("{:#}", e)),
        };
        debug!("Sent {}", signature);

        // the ledger may not honour the timeout it is given
        let timeout = self.settings.confirm_timeout;
        let confirmation = match tokio::time::timeout(
            timeout,
            self.ledger
                .confirm_transaction(&signature, timeout, self.settings.confirm_poll),
        )
        .await
        {
            Ok(confirmed) => confirmed,
            Err(_) => Err(ReloadError::Timeout(format!(
                "{} not confirmed within {:?}",
                signature, timeout
            ))
            .into()),
        }
        .map_err(|e| format!("{:#}", e));

        if let Err(reason) = &confirmation {
            warn!("Transaction {} did not confirm: {}", signature, reason);
        }
        SendOutcome::Sent {
            signature,
            confirmation,
        }
    }
}
