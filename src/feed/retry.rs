use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{FeedSource, FetchError};
use crate::models::{Review, Target};
use crate::notifications::AlertSink;

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound (exclusive) of the random delay added to each wait
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_jitter: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt_index`, without jitter
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    fn backoff(&self, attempt_index: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(..jitter_ms))
        };
        self.delay_for_attempt(attempt_index) + jitter
    }
}

/// Fetches feed pages with retries, alerting once attempts are exhausted
#[derive(Clone)]
pub struct FeedFetcher {
    source: Arc<dyn FeedSource>,
    alerts: Arc<dyn AlertSink>,
    policy: RetryPolicy,
}

impl FeedFetcher {
    pub fn new(source: Arc<dyn FeedSource>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            source,
            alerts,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fetch one page, retrying until it succeeds or the attempt budget runs out.
    ///
    /// `cancel` aborts immediately with [`FetchError::Cancelled`]. `deadline` bounds
    /// the whole call: hitting it mid-request fails that attempt, hitting it while
    /// backing off returns [`FetchError::DeadlineExceeded`]. Neither of those early
    /// exits raises an alert. A pending alert is abandoned when `cancel` fires.
    pub async fn fetch_page(
        &self,
        target: &Target,
        page: u32,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Vec<Review>, FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        let err = loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = sleep_until(deadline) => Err(FetchError::DeadlineExceeded),
                result = self.source.fetch_page(target, page) => result,
            };

            let err = match result {
                Ok(reviews) => return Ok(reviews),
                Err(err) => err,
            };

            attempt += 1;
            if attempt >= max_attempts {
                break err;
            }

            let wait = self.policy.backoff(attempt - 1);
            warn!(
                key = %target,
                page,
                attempt,
                max_attempts,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "Feed fetch attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = sleep_until(deadline) => return Err(FetchError::DeadlineExceeded),
                _ = sleep(wait) => {}
            }
        };

        let error_type = err.error_type();
        let key = target.key();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(key = %target, error_type = %error_type, "Shutdown requested, dropping fetch failure alert");
            }
            result = self.alerts.notify_fetch_failure(&key, &error_type) => {
                if let Err(alert_err) = result {
                    warn!(key = %target, error = %alert_err, "Failed to deliver fetch failure alert");
                }
            }
        }

        Err(err)
    }
}
