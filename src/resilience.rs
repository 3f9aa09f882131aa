//! Bounded calls to the metadata store and serving backend.
//!
//! Every upstream call runs under a deadline. A call that exceeds it fails with
//! [`CanariaError::UpstreamTimeout`] and is never retried here: a timed out write
//! leaves the run status ambiguous, and the caller decides what to do with it.

use crate::error::{CanariaError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Execute an upstream operation with a deadline.
pub async fn with_deadline<Fut, T>(operation: &str, timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, timeout_ms = timeout.as_millis() as u64, "Upstream call timed out");
            Err(CanariaError::UpstreamTimeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let result = with_deadline("fast", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let result: Result<()> = with_deadline("slow", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(CanariaError::UpstreamTimeout { operation, timeout_ms }) => {
                assert_eq!(operation, "slow");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: Result<()> = with_deadline("lookup", Duration::from_secs(1), async {
            Err(CanariaError::NotFound("r1".into()))
        })
        .await;
        assert!(matches!(result, Err(CanariaError::NotFound(_))));
    }
}
