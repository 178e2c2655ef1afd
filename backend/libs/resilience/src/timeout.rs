/// Deadline and cancellation wrappers for store calls
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutError {
    #[error("Operation timed out after {0:?}")]
    Elapsed(Duration),
    #[error("Operation cancelled")]
    Cancelled,
}

/// Execute a future with timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError::Elapsed(duration))
}

/// Execute a future until it completes or `cancel` fires
pub async fn with_cancel<F, T>(cancel: &CancellationToken, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    if cancel.is_cancelled() {
        return Err(TimeoutError::Cancelled);
    }
    tokio::select! {
        out = future => Ok(out),
        _ = cancel.cancelled() => Err(TimeoutError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_timeout_elapsed() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;
        assert!(matches!(result, Err(TimeoutError::Elapsed(_))));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = with_cancel(&cancel, async { 1 }).await;
        assert_eq!(result, Err(TimeoutError::Cancelled));
    }
}
