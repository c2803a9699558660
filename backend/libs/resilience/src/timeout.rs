//! Deadlines for async operations

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Outcome of a bounded fallible call
#[derive(Debug, thiserror::Error)]
pub enum DeadlineError<E> {
    #[error("Operation timed out after {0:?}")]
    Elapsed(Duration),
    #[error(transparent)]
    Inner(E),
}

impl<E> DeadlineError<E> {
    pub fn is_elapsed(&self) -> bool {
        matches!(self, DeadlineError::Elapsed(_))
    }
}

/// Execute an infallible future with a deadline
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, DeadlineError<()>>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| DeadlineError::Elapsed(duration))
}

/// Execute a fallible future with a deadline, keeping its error type
pub async fn with_deadline<F, T, E>(duration: Duration, future: F) -> Result<T, DeadlineError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match timeout(duration, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DeadlineError::Inner(e)),
        Err(_) => Err(DeadlineError::Elapsed(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_timeout_elapsed() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(matches!(result, Err(DeadlineError::Elapsed(_))));
    }

    #[tokio::test]
    async fn test_deadline_keeps_inner_error() {
        #[derive(Debug, PartialEq)]
        struct Rejected(u16);

        let result = with_deadline(Duration::from_secs(1), async {
            Err::<i32, _>(Rejected(409))
        })
        .await;

        match result {
            Err(DeadlineError::Inner(e)) => assert_eq!(e, Rejected(409)),
            other => panic!("expected inner error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_elapsed() {
        let result = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, String>(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_elapsed());
        assert_eq!(err.to_string(), "Operation timed out after 10ms");
    }
}
