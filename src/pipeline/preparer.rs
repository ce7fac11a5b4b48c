//! Turns a `SwapJob` into an unsigned transaction bound to a blockhash.

use crate::pipeline::aggregator::{SwapAggregator, SwapRequest};
use crate::pipeline::rpc::{parse_address, TOKEN_PROGRAM_ID};
use crate::pipeline::types::{FeeConfig, SubmitConfig};
use crate::types::{JobAction, SwapJob};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::message::{v0, VersionedMessage};
use solana_sdk::pubkey::Pubkey as SolanaPubkey;
use solana_sdk::signature::Signature;
use solana_sdk::system_instruction;
use solana_sdk::transaction::VersionedTransaction;
use std::sync::Arc;
use tracing::{debug, warn};

/// Associated Token Account program.
pub const ASSOCIATED_TOKEN_PROGRAM_ID: SolanaPubkey =
    solana_sdk::pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

const CLOSE_ACCOUNT_TAG: u8 = 9;
const BURN_CHECKED_TAG: u8 = 15;

/// Batch-wide inputs shared by every job.
#[derive(Debug, Clone, Copy)]
pub struct PrepareContext {
    pub payer: SolanaPubkey,
    pub blockhash: Hash,
}

#[async_trait]
pub trait TransactionPreparer: Send + Sync {
    async fn prepare(&self, job: &SwapJob, ctx: &PrepareContext) -> Result<VersionedTransaction>;
}

/// Prepares each job according to its `JobAction`.
pub struct JobPreparer {
    aggregator: Arc<dyn SwapAggregator>,
    slippage: f64,
    priority_fee: f64,
    fee_recipient: Option<SolanaPubkey>,
    close_fee_lamports: u64,
    compute_unit_price: u64,
    compute_unit_limit: u32,
}

impl JobPreparer {
    pub fn new(aggregator: Arc<dyn SwapAggregator>, submit: &SubmitConfig, fee: &FeeConfig) -> Result<Self> {
        let fee_recipient = fee
            .recipient
            .as_deref()
            .map(parse_address)
            .transpose()
            .context("Invalid fee recipient")?;

        Ok(Self {
            aggregator,
            slippage: submit.slippage,
            priority_fee: submit.priority_fee,
            fee_recipient,
            close_fee_lamports: fee.close_fee_lamports,
            compute_unit_price: fee.compute_unit_price,
            compute_unit_limit: fee.compute_unit_limit,
        })
    }

    fn compute_budget(&self) -> Vec<Instruction> {
        let mut ixs = Vec::with_capacity(2);
        if self.compute_unit_price > 0 {
            ixs.push(ComputeBudgetInstruction::set_compute_unit_price(self.compute_unit_price));
        }
        if self.compute_unit_limit > 0 {
            ixs.push(ComputeBudgetInstruction::set_compute_unit_limit(self.compute_unit_limit));
        }
        ixs
    }

    /// Close an empty token account, returning its rent to the payer. The
    /// close fee rides along in the same transaction.
    fn close(&self, job: &SwapJob, ctx: &PrepareContext) -> Result<VersionedTransaction> {
        if job.amount_base_units != 0 {
            bail!("token account for {} still holds {} base units", job.mint, job.amount_base_units);
        }
        let account = token_account_for(job, &ctx.payer)?;

        let mut ixs = self.compute_budget();
        ixs.push(close_account_instruction(&account, &ctx.payer, &ctx.payer));
        if let Some(recipient) = &self.fee_recipient {
            if self.close_fee_lamports > 0 {
                ixs.push(system_instruction::transfer(&ctx.payer, recipient, self.close_fee_lamports));
            }
        }
        debug!("Prepared close of {}", account);
        unsigned_transaction(&ctx.payer, &ixs, ctx.blockhash)
    }

    /// Burn the full balance of the job's token account.
    fn burn(&self, job: &SwapJob, ctx: &PrepareContext) -> Result<VersionedTransaction> {
        if job.amount_base_units == 0 {
            bail!("nothing to burn for {}", job.mint);
        }
        let account = token_account_for(job, &ctx.payer)?;
        let mint = parse_address(&job.mint)?;

        let mut ixs = self.compute_budget();
        ixs.push(burn_checked_instruction(&account, &mint, &ctx.payer, job.amount_base_units, job.decimals));
        debug!("Prepared burn of {} from {}", job.amount_base_units, account);
        unsigned_transaction(&ctx.payer, &ixs, ctx.blockhash)
    }

    fn service_fee(&self, job: &SwapJob, ctx: &PrepareContext) -> Result<VersionedTransaction> {
        let Some(recipient) = &self.fee_recipient else {
            bail!("no fee recipient configured");
        };
        if job.amount_base_units == 0 {
            bail!("service fee of 0 lamports");
        }

        let mut ixs = self.compute_budget();
        ixs.push(system_instruction::transfer(&ctx.payer, recipient, job.amount_base_units));
        debug!("Prepared service fee of {} lamports to {}", job.amount_base_units, recipient);
        unsigned_transaction(&ctx.payer, &ixs, ctx.blockhash)
    }

    async fn swap(&self, job: &SwapJob, ctx: &PrepareContext) -> Result<VersionedTransaction> {
        if job.amount_base_units == 0 {
            bail!("nothing to swap for {}", job.mint);
        }

        let request = SwapRequest {
            from: job.mint.clone(),
            to: job.desired_output_mint.clone(),
            amount: job.amount_base_units as f64 / 10f64.powi(job.decimals as i32),
            slippage: self.slippage,
            payer: ctx.payer.to_string(),
            priority_fee: self.priority_fee,
        };

        let mut tx = self.aggregator.swap_transaction(&request).await?;
        tx.message.set_recent_blockhash(ctx.blockhash);
        Ok(tx)
    }
}

#[async_trait]
impl TransactionPreparer for JobPreparer {
    async fn prepare(&self, job: &SwapJob, ctx: &PrepareContext) -> Result<VersionedTransaction> {
        match job.action {
            JobAction::Swap => self.swap(job, ctx).await,
            JobAction::Close => self.close(job, ctx),
            JobAction::Burn => self.burn(job, ctx),
            JobAction::SwapOrBurn => match self.swap(job, ctx).await {
                Ok(tx) => Ok(tx),
                Err(e) => {
                    warn!("Swap for {} unavailable, burning instead: {:#}", job.mint, e);
                    self.burn(job, ctx)
                }
            },
            JobAction::ServiceFee => self.service_fee(job, ctx),
        }
    }
}

/// The job's token account, or the owner's associated account for the mint.
fn token_account_for(job: &SwapJob, owner: &SolanaPubkey) -> Result<SolanaPubkey> {
    match &job.token_account {
        Some(account) => parse_address(account),
        None => {
            let mint = parse_address(&job.mint)?;
            Ok(associated_token_address(owner, &mint))
        }
    }
}

pub fn associated_token_address(owner: &SolanaPubkey, mint: &SolanaPubkey) -> SolanaPubkey {
    SolanaPubkey::find_program_address(
        &[owner.as_ref(), TOKEN_PROGRAM_ID.as_ref(), mint.as_ref()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )
    .0
}

pub fn close_account_instruction(
    account: &SolanaPubkey,
    destination: &SolanaPubkey,
    owner: &SolanaPubkey,
) -> Instruction {
    Instruction {
        program_id: TOKEN_PROGRAM_ID,
        accounts: vec![
            AccountMeta::new(*account, false),
            AccountMeta::new(*destination, false),
            AccountMeta::new_readonly(*owner, true),
        ],
        data: vec![CLOSE_ACCOUNT_TAG],
    }
}

pub fn burn_checked_instruction(
    account: &SolanaPubkey,
    mint: &SolanaPubkey,
    owner: &SolanaPubkey,
    amount: u64,
    decimals: u8,
) -> Instruction {
    let mut data = Vec::with_capacity(10);
    data.push(BURN_CHECKED_TAG);
    data.extend_from_slice(&amount.to_le_bytes());
    data.push(decimals);

    Instruction {
        program_id: TOKEN_PROGRAM_ID,
        accounts: vec![
            AccountMeta::new(*account, false),
            AccountMeta::new(*mint, false),
            AccountMeta::new_readonly(*owner, true),
        ],
        data,
    }
}

/// v0 transaction with placeholder signatures, ready for the wallet.
pub fn unsigned_transaction(
    payer: &SolanaPubkey,
    instructions: &[Instruction],
    blockhash: Hash,
) -> Result<VersionedTransaction> {
    let message = v0::Message::try_compile(payer, instructions, &[], blockhash)
        .context("Failed to compile transaction message")?;
    let signers = message.header.num_required_signatures as usize;
    Ok(VersionedTransaction {
        signatures: vec![Signature::default(); signers],
        message: VersionedMessage::V0(message),
    })
}
