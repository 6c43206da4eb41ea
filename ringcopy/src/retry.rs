//! Exponential back-off for timed-out queries.
//!
//! Reads and writes back off identically: a timed-out attempt sleeps a
//! random number of whole seconds in `[0, 2^(n+1))` and retries, until the
//! attempt budget is spent.

use std::time::Duration;

use rand::Rng;

use crate::driver::{BatchRequest, DriverError, DriverSession, Page, SelectQuery};

/// Outcome of a timeout during attempt `retry_num`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// The back-off policy; cheap to copy into every worker.
#[derive(Debug, Clone, Copy)]
pub struct ExpBackoffRetry {
    max_attempts: u32,
}

impl ExpBackoffRetry {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Decide what to do after the `retry_num`-th timeout (0-based).
    #[must_use]
    pub fn decide(&self, retry_num: u32) -> RetryDecision {
        if retry_num >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let ceiling = 2u64.saturating_pow(retry_num + 1);
        let delay = rand::thread_rng().gen_range(0..ceiling);
        RetryDecision::Retry { delay: Duration::from_secs(delay) }
    }
}

/// Run a batch write, absorbing timeout-class errors per the policy.
///
/// Non-timeout errors surface immediately; they belong to the caller's own
/// retry accounting.
///
/// # Errors
///
/// The last driver error once the policy gives up.
pub async fn execute_batch_with_retry(
    session: &dyn DriverSession,
    batch: &BatchRequest,
    policy: ExpBackoffRetry,
) -> Result<(), DriverError> {
    let mut retry_num = 0u32;
    loop {
        match session.execute_batch(batch).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_timeout() => match policy.decide(retry_num) {
                RetryDecision::Retry { delay } => {
                    tracing::debug!(retry_num, delay_s = delay.as_secs(), error = %e, "timeout, backing off");
                    tokio::time::sleep(delay).await;
                    retry_num += 1;
                }
                RetryDecision::GiveUp => {
                    tracing::debug!(retry_num, error = %e, "timeout, giving up");
                    return Err(e);
                }
            },
            Err(e) => return Err(e),
        }
    }
}

/// Fetch one result page, absorbing timeout-class errors per the policy.
///
/// # Errors
///
/// The last driver error once the policy gives up.
pub async fn select_page_with_retry(
    session: &dyn DriverSession,
    query: &SelectQuery,
    paging_state: Option<u64>,
    policy: ExpBackoffRetry,
) -> Result<Page, DriverError> {
    let mut retry_num = 0u32;
    loop {
        match session.select_page(query, paging_state).await {
            Ok(page) => return Ok(page),
            Err(e) if e.is_timeout() => match policy.decide(retry_num) {
                RetryDecision::Retry { delay } => {
                    tracing::debug!(retry_num, delay_s = delay.as_secs(), error = %e, "timeout, backing off");
                    tokio::time::sleep(delay).await;
                    retry_num += 1;
                }
                RetryDecision::GiveUp => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}
