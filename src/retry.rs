use crate::error::LocateError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, LocateError>;

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max_delay_ms`
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Backoff {
    fn delay_ms(&self, attempt: u32) -> u64 {
        let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
        self.base_delay_ms.saturating_mul(pow).min(self.max_delay_ms)
    }
}

/// Retry executor for transient upstream failures
pub struct RetryExecutor {
    backoff: Backoff,
}

impl RetryExecutor {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }

    /// Execute an operation, retrying only errors that report `is_recoverable()`
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!("Attempt {} of {}", attempt, max_attempts);

            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_recoverable() || attempt >= max_attempts {
                        return Err(err);
                    }

                    let delay_ms = self.backoff.delay_ms(attempt);
                    warn!("Attempt {} failed: {}, retrying in {}ms", attempt, err.detail(), delay_ms);
                    sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Await `fut` for at most `timeout`, mapping an elapsed deadline to `UpstreamTimeout`.
pub async fn with_timeout<T, Fut>(service: &str, timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(LocateError::UpstreamTimeout {
            service: service.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Try each provider in order and return the first success.
///
/// When every provider fails the last error is returned.
pub async fn try_in_order<'a, P, F, Fut, T>(providers: &'a [P], mut operation: F) -> Result<T>
where
    F: FnMut(&'a P) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for (index, provider) in providers.iter().enumerate() {
        match operation(provider).await {
            Ok(value) => {
                if index > 0 {
                    debug!(attempt = index + 1, "Fallback provider succeeded");
                }
                return Ok(value);
            }
            Err(err) => {
                warn!(attempt = index + 1, of = providers.len(), "Provider failed: {}", err.detail());
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| LocateError::Internal("no providers configured".to_string())))
}
