//! ReloadSOL - token account sweeping for Solana wallets
//!
//! Enumerates a wallet's SPL token accounts, resolves metadata and USD prices
//! behind a rate limiter and a persisted cache, and submits batches of swap,
//! close or burn transactions with per-job results.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod types;

// Re-export main types for convenience
pub use error::ReloadError;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use types::{BatchReport, SwapJob, SwapResult, TokenHolding, TokenMetadata};
