//! Error taxonomy for the sweep pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReloadError {
    /// Network hiccup or 5xx; worth retrying
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Rate limited by {0}")]
    RateLimited(String),

    /// Upstream answered with something we cannot use; never retried
    #[error("Malformed payload from {source_name}: {message}")]
    MalformedPayload {
        source_name: String,
        message: String,
    },

    #[error("Invalid address {0}")]
    InvalidAddress(String),

    #[error("Wallet not connected")]
    WalletNotConnected,

    #[error("Wallet rejected signing: {0}")]
    SigningRejected(String),

    #[error("Confirmation failed: {0}")]
    ConfirmationFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ReloadError {
    pub fn malformed(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_) | Self::Timeout(_))
    }
}

/// Retry predicate over `anyhow` errors.
///
/// Errors that did not originate in this crate (reqwest, RPC client) count as
/// transient.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<ReloadError>() {
        Some(e) => e.is_retryable(),
        None => true,
    }
}

/// Heuristic used by the RPC manager and HTTP clients to spot quota errors.
pub fn looks_rate_limited(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_predicate() {
        assert!(is_retryable(&anyhow::Error::new(ReloadError::Transient("x".into()))));
        assert!(!is_retryable(&anyhow::Error::new(ReloadError::malformed("api", "bad json"))));
        assert!(!is_retryable(&anyhow::Error::new(ReloadError::WalletNotConnected)));
        assert!(is_retryable(&anyhow::anyhow!("connection reset")));
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(looks_rate_limited("HTTP status client error (429 Too Many Requests)"));
        assert!(looks_rate_limited("Rate limit exceeded"));
        assert!(!looks_rate_limited("account not found"));
    }
}
