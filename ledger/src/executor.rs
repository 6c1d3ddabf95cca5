//! Retrying transactional executor.
//!
//! Runs a unit of work inside a serializable transaction. When the work or
//! the commit fails with a retryable conflict, the whole attempt is re-run
//! after a quadratic, jittered backoff. Any other failure rolls back and is
//! returned unchanged.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ledgerline_common::{LedgerError, Result};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::store::TxBackend;

/// Attempt cap and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(20),
            max_jitter: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based): `attempt^2 * base + jitter`.
    pub fn backoff(&self, attempt: u32, jitter: Duration) -> Duration {
        self.base_backoff
            .saturating_mul(attempt.saturating_mul(attempt))
            .saturating_add(jitter)
    }
}

/// Source of random backoff jitter.
pub trait JitterSource: Send + Sync {
    /// A duration in `0..=max`.
    fn jitter(&self, max: Duration) -> Duration;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn jitter(&self, max: Duration) -> Duration {
        let max_us = u64::try_from(max.as_micros()).unwrap_or(u64::MAX);
        if max_us == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=max_us))
    }
}

/// No jitter; backoff becomes deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn jitter(&self, _max: Duration) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Default)]
struct ExecutorCounters {
    attempts: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time copy of the executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub attempts: u64,
    pub retries: u64,
    pub exhausted: u64,
    pub timeouts: u64,
}

pub struct TxExecutor<B: TxBackend> {
    backend: Arc<B>,
    policy: RetryPolicy,
    jitter: Arc<dyn JitterSource>,
    deadline: Option<Duration>,
    counters: ExecutorCounters,
}

impl<B: TxBackend> TxExecutor<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            policy: RetryPolicy::default(),
            jitter: Arc::new(RandomJitter),
            deadline: None,
            counters: ExecutorCounters::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Bound the whole call, retries included. On expiry the open
    /// transaction is dropped, which rolls it back.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Run `work` in a transaction, retrying on conflict.
    ///
    /// `work` receives a fresh handle on every attempt and may be called up
    /// to `max_attempts` times, so it must not carry side effects outside
    /// the transaction between attempts.
    pub async fn with_transaction<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnMut(B::Tx) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        match self.deadline {
            Some(limit) => match tokio::time::timeout(limit, self.run_attempts(work)).await {
                Ok(result) => result,
                Err(_) => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(deadline_ms = limit.as_millis() as u64, "Transaction deadline exceeded");
                    Err(LedgerError::Timeout(format!(
                        "transaction exceeded {}ms deadline",
                        limit.as_millis()
                    )))
                }
            },
            None => self.run_attempts(work).await,
        }
    }

    async fn run_attempts<T, F, Fut>(&self, mut work: F) -> Result<T>
    where
        F: FnMut(B::Tx) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let err = match self.attempt_once(&mut work).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            if attempt >= max_attempts {
                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(attempts = attempt, error = %err, "Transaction retry limit exceeded");
                return Err(LedgerError::RetryLimitExceeded { attempts: attempt });
            }

            let delay = self
                .policy
                .backoff(attempt, self.jitter.jitter(self.policy.max_jitter));
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying transaction after conflict"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt_once<T, F, Fut>(&self, work: &mut F) -> Result<T>
    where
        F: FnMut(B::Tx) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let tx = self.backend.begin().await?;
        match work(tx.clone()).await {
            Ok(value) => {
                self.backend.commit(tx).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.backend.rollback(tx).await {
                    debug!(error = %rollback_err, "Rollback after failed work also failed");
                }
                Err(err)
            }
        }
    }
}
