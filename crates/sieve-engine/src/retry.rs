//! Bounded retries with linear backoff and jitter.

use rand::Rng;
use sieve_browser::{BrowserError, BrowserSession};
use std::future::Future;
use std::time::Duration;

/// Retry settings for one kind of operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub retries: u32,
    /// Backoff before retry `n` is `base * n`, plus up to a quarter of that as jitter.
    pub base: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(retries: u32, base: Duration) -> Self {
        Self { retries, base }
    }

    /// Single attempt, no waiting.
    #[must_use]
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.saturating_mul(attempt);
        let spread = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
        if spread == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects,
    /// or the retries are used up.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        retryable: impl Fn(&BrowserError) -> bool,
        mut op: F,
    ) -> Result<T, BrowserError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrowserError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retries && retryable(&e) => {
                    attempt += 1;
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        attempt,
                        self.retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Navigate under `timeout`, retrying failures the session marks retryable.
pub async fn navigate(
    session: &dyn BrowserSession,
    url: &str,
    policy: RetryPolicy,
    timeout: Duration,
) -> Result<(), BrowserError> {
    policy
        .run(
            &format!("Navigation to {url}"),
            BrowserError::is_retryable,
            move || async move {
                tokio::time::timeout(timeout, session.navigate(url))
                    .await
                    .map_err(|_| BrowserError::Timeout(format!("navigating to {url}")))?
            },
        )
        .await
}
