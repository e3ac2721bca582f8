//! Bounded retry for bridge submissions
//!
//! Fixed backoff between attempts, early exit on fatal, validation and
//! cancellation errors, and a cancellable wait between attempts.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BridgeOutError, Result};

/// Submission retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Wait between attempts
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Whether another attempt may follow attempt number `attempt` (1-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure (RPC timeout, network issues, missing receipt)
    Transient,
    /// Transaction underpriced; the next attempt re-reads the gas price
    Underpriced,
    /// Stale nonce; the next attempt re-reads the pending nonce
    Nonce,
    /// Do not retry (malformed request, insufficient funds)
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

/// Classify an error message for retry decisions
pub fn classify_message(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
        || error_lower.contains("max fee per gas less than")
    {
        return ErrorClass::Underpriced;
    }

    if error_lower.contains("nonce too low")
        || error_lower.contains("nonce too high")
        || error_lower.contains("already known")
    {
        return ErrorClass::Nonce;
    }

    if error_lower.contains("insufficient funds")
        || error_lower.contains("invalid signature")
        || error_lower.contains("invalid parameters")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Classify a bridge error for retry decisions
pub fn classify_error(error: &BridgeOutError) -> ErrorClass {
    match error {
        BridgeOutError::InvalidRequest(_) | BridgeOutError::SignatureLength { .. } => {
            ErrorClass::Permanent
        }
        BridgeOutError::Signing(_) | BridgeOutError::Config(_) => ErrorClass::Permanent,
        BridgeOutError::ReceiptNotFound { .. } => ErrorClass::Transient,
        // A reverted submission is resubmitted with fresh pricing and nonce
        BridgeOutError::Reverted { .. } => ErrorClass::Unknown,
        BridgeOutError::Rpc(message)
        | BridgeOutError::Http(message)
        | BridgeOutError::Storage(message) => classify_message(message),
        BridgeOutError::Cancelled => ErrorClass::Permanent,
    }
}

/// Run `operation` up to `config.max_attempts` times.
///
/// `operation` receives the 1-based attempt number. Fatal, cancellation and
/// permanent errors are returned immediately; otherwise the last error is
/// returned once attempts are exhausted. Cancellation during a backoff wait
/// returns [`BridgeOutError::Cancelled`].
pub async fn retry_with_backoff<F, T, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    label: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(BridgeOutError::Cancelled);
        }
        attempt += 1;

        let error = match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        let class = classify_error(&error);
        if error.is_fatal() || error.is_cancelled() || class == ErrorClass::Permanent {
            debug!(label, attempt, error = %error, "Not retrying");
            return Err(error);
        }

        if !config.should_retry(attempt) {
            warn!(
                label,
                attempt,
                max = config.max_attempts,
                error = %error,
                "Retry attempts exhausted"
            );
            return Err(error);
        }

        warn!(
            label,
            attempt,
            max = config.max_attempts,
            backoff_secs = config.backoff.as_secs(),
            class = ?class,
            error = %error,
            "Retrying after backoff"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(BridgeOutError::Cancelled),
            _ = tokio::time::sleep(config.backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_message_classification() {
        assert_eq!(classify_message("connection timeout"), ErrorClass::Transient);
        assert_eq!(
            classify_message("replacement transaction underpriced"),
            ErrorClass::Underpriced
        );
        assert_eq!(classify_message("nonce too low"), ErrorClass::Nonce);
        assert_eq!(
            classify_message("insufficient funds for gas * price + value"),
            ErrorClass::Permanent
        );
        assert_eq!(classify_message("some unknown error"), ErrorClass::Unknown);
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            classify_error(&BridgeOutError::SignatureLength {
                expected: 65,
                got: 64
            }),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_error(&BridgeOutError::ReceiptNotFound {
                tx_hash: "0x01".into(),
                waited_secs: 60
            }),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_error(&BridgeOutError::Reverted {
                tx_hash: "0x01".into()
            }),
            ErrorClass::Unknown
        );
        assert_eq!(
            classify_error(&BridgeOutError::Rpc("nonce too low".into())),
            ErrorClass::Nonce
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::default();
        let cancel = CancellationToken::new();

        let counter = calls.clone();
        let result = retry_with_backoff(&config, &cancel, "test", |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(BridgeOutError::Rpc("connection reset".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::default();
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let counter = calls.clone();
        let result: Result<()> = retry_with_backoff(&config, &cancel, "test", |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(BridgeOutError::Rpc("timeout".into()))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), "rpc");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // four backoff waits between five attempts
        assert_eq!(started.elapsed(), Duration::from_secs(240));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counter = calls.clone();
        let result: Result<()> =
            retry_with_backoff(&RetryConfig::default(), &cancel, "test", |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BridgeOutError::Signing("bad key".into()))
                }
            })
            .await;

        assert!(result.unwrap_err().is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        let result: Result<()> =
            retry_with_backoff(&RetryConfig::default(), &cancel, "test", |_| async {
                Err(BridgeOutError::Rpc("timeout".into()))
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
    }
}
