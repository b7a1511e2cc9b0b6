use std::{future::Future, time::Duration};

use energy_client::StoreError;

/// Runs one store call under `deadline`. Expiry is reported as a transient
/// failure; the dropped future never commits a partial fold.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(res) => res,
        Err(_) => Err(StoreError::Transient(format!(
            "store call exceeded {}ms deadline",
            deadline.as_millis()
        ))),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RetryError {
    /// Every attempt failed with a retryable error.
    #[error("{op} gave up after {attempts} attempts: {source}")]
    Exhausted {
        op: &'static str,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("{op} failed: {source}")]
    Permanent {
        op: &'static str,
        #[source]
        source: StoreError,
    },
}

impl RetryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn store_error(&self) -> &StoreError {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Permanent { source, .. } => source,
        }
    }
}

/// Bounded retry with linear backoff for steady-state store calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub deadline: Duration,
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match with_deadline(self.deadline, call()).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.backoff * attempt;
                    tracing::warn!(error = %e, op, attempt, "store call failed, retrying with backoff");
                    metrics::counter!("rollup_store_retries_total", "op" => op).increment(1);
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) if e.is_retryable() => {
                    tracing::error!(error = %e, op, attempts = attempt + 1, "store call failed, giving up");
                    return Err(RetryError::Exhausted {
                        op,
                        attempts: attempt + 1,
                        source: e,
                    });
                }
                Err(e) => {
                    return Err(RetryError::Permanent { op, source: e });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Duration::from_millis(10),
            deadline: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let res = policy(3)
            .run("test", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Transient("lock timeout".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_retries_surfaces_a_retryable_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let res: Result<(), _> = policy(2)
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Transient("connection reset".to_string()))
            })
            .await;
        let err = res.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let res: Result<(), _> = policy(5)
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Backend("check constraint".to_string()))
            })
            .await;
        assert!(matches!(res, Err(RetryError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_is_transient() {
        let res: Result<(), _> = with_deadline(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(res.unwrap_err().is_retryable());
    }
}
