//! Timeout, retry and cancellation around individual store calls.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::error::{KgError, KgResult};

/// Wraps every store call with its own deadline and the retry policy.
#[derive(Debug, Clone)]
pub struct StoreCaller {
    policy: RetryPolicy,
    timeout: Duration,
}

impl StoreCaller {
    pub fn new(policy: RetryPolicy, timeout: Duration) -> Self {
        Self { policy, timeout }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_max_times(self.policy.max_retries as usize)
            .with_min_delay(Duration::from_millis(self.policy.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.policy.max_delay_ms))
            .with_factor(self.policy.multiplier)
    }

    /// Run `call`, retrying retryable failures with exponential backoff.
    ///
    /// Each attempt is bounded by the call timeout. Cancellation aborts the
    /// attempt in flight and any pending backoff.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        call: F,
    ) -> KgResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KgResult<T>>,
    {
        if cancel.is_cancelled() {
            return Err(KgError::cancelled(operation));
        }

        let timeout = self.timeout;
        let mut call = call;
        let attempt = || {
            let fut = call();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(KgError::timeout(operation, timeout)),
                }
            }
        };

        let retried = attempt
            .retry(self.backoff())
            .when(KgError::is_retryable)
            .notify(|err, dur| {
                tracing::warn!(
                    "Store call {} failed, retrying in {:?}: {}",
                    operation,
                    dur,
                    err
                );
            });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KgError::cancelled(operation)),
            result = retried => result,
        }
    }
}
