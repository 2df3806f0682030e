//! Retry executor shared by queries and mutations.
//!
//! A [`Retryer`] wraps an arbitrary asynchronous operation with
//! cancellation, a retry policy, and a backoff schedule. Waiting between
//! attempts is a cancellable timed task, never a blocking sleep, and time
//! spent offline is parked rather than counted against the schedule.

use futures::future::BoxFuture;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::FetchPolicy;
use crate::error::QueryError;
use crate::signals::OnlineManager;

/// Executes an operation with retries, backoff, and pause/resume.
///
/// The operation is a closure producing one attempt at a time; it receives
/// the number of failures so far, so an attempt can adapt if it wants to.
/// Cancellation aborts the current attempt and suppresses any pending retry
/// timer; the outcome is [`QueryError::Cancelled`], distinct from a domain
/// failure.
pub struct Retryer {
    policy: FetchPolicy,
    token: CancellationToken,
    online: OnlineManager,
}

impl Retryer {
    /// Creates a retryer bound to a cancellation token and the online
    /// signal it parks on while connectivity is lost.
    #[must_use]
    pub fn new(policy: FetchPolicy, token: CancellationToken, online: OnlineManager) -> Self {
        Self {
            policy,
            token,
            online,
        }
    }

    /// Runs `op` until it succeeds, the retry policy gives up, or the
    /// token fires.
    ///
    /// `on_pause` is invoked with `true` when the retryer parks on lost
    /// connectivity and `false` when it resumes; the pause does not consume
    /// the retry budget or the backoff schedule.
    pub async fn run<T, F>(&self, mut op: F, on_pause: impl Fn(bool)) -> Result<T, QueryError>
    where
        F: FnMut(u32) -> BoxFuture<'static, Result<T, QueryError>>,
    {
        let mut failures: u32 = 0;

        loop {
            if self.token.is_cancelled() {
                return Err(QueryError::Cancelled);
            }

            if !self.online.is_online() {
                trace!("fetch paused: offline");
                on_pause(true);
                let resumed = self.online.wait_until_online(&self.token).await;
                on_pause(false);
                if !resumed {
                    return Err(QueryError::Cancelled);
                }
                trace!("fetch resumed: back online");
            }

            let attempt = op(failures);
            let result = tokio::select! {
                _ = self.token.cancelled() => return Err(QueryError::Cancelled),
                result = attempt => result,
            };

            match result {
                Ok(value) => return Ok(value),
                // Cancellation surfaced by the operation itself is terminal.
                Err(QueryError::Cancelled) => return Err(QueryError::Cancelled),
                Err(error) => {
                    failures += 1;
                    if !self.policy.retry.should_retry(failures, &error) {
                        debug!(failures, %error, "fetch failed, retries exhausted");
                        return Err(error);
                    }

                    let delay = self.policy.retry_delay.for_attempt(failures - 1, &error);
                    trace!(failures, ?delay, "fetch failed, retrying");
                    tokio::select! {
                        _ = self.token.cancelled() => return Err(QueryError::Cancelled),
                        () = sleep(delay) => {}
                    }
                }
            }
        }
    }
}
