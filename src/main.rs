//! ReloadSOL command-line entry point.
//!
//! Scans a wallet for empty and dust token accounts, closes the empty ones
//! and sweeps the dust into SOL.

use anyhow::Result;
use clap::{Parser, Subcommand};
use reloadsol::config::ReloadConfig;
use reloadsol::pipeline::{KeypairSigner, Pipeline, PipelineBuilder, WalletScan, WalletSigner};
use reloadsol::types::{BatchReport, JobAction, SwapJob, SwapStatus};
use std::path::PathBuf;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "reloadsol")]
#[command(about = "Reclaim rent and sweep dust from Solana token accounts", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "RELOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List token accounts, prices and dust for a wallet
    Scan {
        /// Wallet address
        owner: String,

        /// Ignore the cached token list
        #[arg(long)]
        refresh: bool,
    },
    /// Close every empty token account and reclaim its rent
    CloseEmpty {
        /// Keypair file of the wallet owner
        #[arg(short, long, env = "RELOAD_KEYPAIR")]
        keypair: PathBuf,

        /// Only print what would be closed
        #[arg(long)]
        dry_run: bool,
    },
    /// Swap dust holdings into SOL
    Sweep {
        #[arg(short, long, env = "RELOAD_KEYPAIR")]
        keypair: PathBuf,

        /// Burn holdings that have no swap route
        #[arg(long)]
        burn_fallback: bool,

        /// Dust threshold in USD, overrides the configuration
        #[arg(long)]
        threshold: Option<f64>,

        #[arg(long)]
        dry_run: bool,
    },
    /// Check whether mints can be swapped into SOL
    Tradeable {
        mints: Vec<String>,
    },
    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove expired entries
    Sweep,
    /// Remove every entry
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let mut config = ReloadConfig::load(cli.config.as_deref())?;
    if let Command::Sweep {
        threshold: Some(threshold),
        ..
    } = &cli.command
    {
        config.dust.threshold_usd = *threshold;
    }

    let pipeline = PipelineBuilder::from_config(config).build().await?;

    match cli.command {
        Command::Scan { owner, refresh } => {
            let scan = pipeline.scan(&owner, refresh).await?;
            print_scan(&scan);
        }
        Command::CloseEmpty { keypair, dry_run } => {
            let signer = KeypairSigner::from_file(&keypair)?;
            close_empty(&pipeline, &signer, dry_run).await?;
        }
        Command::Sweep {
            keypair,
            burn_fallback,
            dry_run,
            ..
        } => {
            let signer = KeypairSigner::from_file(&keypair)?;
            sweep(&pipeline, &signer, burn_fallback, dry_run).await?;
        }
        Command::Tradeable { mints } => {
            let results = pipeline.resolver.check_tradeable(&mints).await;
            for mint in &mints {
                match results.get(mint) {
                    Some(t) if t.tradeable => println!("{}  tradeable", mint),
                    Some(t) => println!(
                        "{}  not tradeable ({})",
                        mint,
                        t.error.as_deref().unwrap_or("unknown")
                    ),
                    None => println!("{}  unknown", mint),
                }
            }
        }
        Command::Cache { action } => match action {
            CacheAction::Sweep => {
                let removed = pipeline.sweep_caches().await?;
                println!("Removed {} expired cache entries", removed);
            }
            CacheAction::Clear => {
                pipeline.clear_caches().await?;
                println!("Cache cleared");
            }
        },
    }

    Ok(())
}

fn owner_of(signer: &dyn WalletSigner) -> Result<String> {
    signer
        .pubkey()
        .map(|key| key.to_string())
        .ok_or_else(|| reloadsol::error::ReloadError::WalletNotConnected.into())
}

async fn close_empty(pipeline: &Pipeline, signer: &dyn WalletSigner, dry_run: bool) -> Result<()> {
    let owner = owner_of(signer)?;
    let enumeration = pipeline.enumerator.enumerate(&owner).await?;
    let jobs: Vec<SwapJob> = enumeration.zero_balance.iter().map(SwapJob::close).collect();

    if jobs.is_empty() {
        println!("No empty token accounts");
        return Ok(());
    }
    if dry_run {
        for job in &jobs {
            println!("would close {} ({})", job.token_account.as_deref().unwrap_or("-"), job.mint);
        }
        return Ok(());
    }

    info!("Closing {} empty token accounts", jobs.len());
    let report = pipeline.submitter.submit(&jobs, signer).await?;
    pipeline.enumerator.forget(&owner).await?;
    print_report(&report);
    Ok(())
}

async fn sweep(pipeline: &Pipeline, signer: &dyn WalletSigner, burn_fallback: bool, dry_run: bool) -> Result<()> {
    let owner = owner_of(signer)?;
    let scan = pipeline.scan(&owner, true).await?;
    let action = if burn_fallback {
        JobAction::SwapOrBurn
    } else {
        JobAction::Swap
    };
    let jobs = pipeline.sweep_jobs(&scan, action);

    if jobs.is_empty() {
        println!("No dust below ${:.2}", pipeline.config.dust.threshold_usd);
        return Ok(());
    }
    if dry_run {
        for holding in &scan.dust {
            println!("would sweep {} {}", holding.format_balance(), holding.mint);
        }
        for job in jobs.iter().filter(|j| j.action == JobAction::ServiceFee) {
            println!("would pay a service fee of {} lamports", job.amount_base_units);
        }
        return Ok(());
    }

    info!("Sweeping {} dust holdings", jobs.len());
    let report = pipeline.submitter.submit(&jobs, signer).await?;
    pipeline.enumerator.forget(&owner).await?;
    if report.failed > 0 {
        warn!("{} jobs failed: {:?}", report.failed, report.failed_mints());
    }
    print_report(&report);
    Ok(())
}

fn print_scan(scan: &WalletScan) {
    println!("Wallet {}", scan.owner);
    println!("{}", "=".repeat(80));
    println!("Empty token accounts: {}", scan.enumeration.zero_balance.len());

    println!("\nFunded token accounts: {}", scan.enumeration.non_zero_balance.len());
    for holding in &scan.enumeration.non_zero_balance {
        match scan.metadata.get(&holding.mint) {
            Some(Some(meta)) => println!(
                "  {:<10} {:>20}  ${:>12.4}  {}",
                meta.symbol,
                holding.format_balance(),
                holding.usd_value(meta.price_usd),
                holding.mint
            ),
            _ => println!("  {:<10} {:>20}  {:>13}  {}", "?", holding.format_balance(), "n/a", holding.mint),
        }
    }

    println!("\nDust holdings: {}", scan.dust.len());
    println!("Total value: ${:.2}", scan.total_usd());
}

fn print_report(report: &BatchReport) {
    println!("{}", "=".repeat(80));
    for result in &report.results {
        let status = match result.status {
            SwapStatus::Confirmed => "confirmed",
            SwapStatus::Failed => "failed",
            SwapStatus::Pending => "pending",
        };
        println!(
            "  {:<10} {:<45} {}",
            status,
            result.mint,
            result
                .signature
                .as_deref()
                .or(result.error.as_deref())
                .unwrap_or("")
        );
    }
    println!("Confirmed: {}  Failed: {}", report.succeeded, report.failed);
}
