use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffStrategy;
use crate::cancel::CancellationToken;
use crate::config::RetryConfig;
use crate::error::{Classify, ErrorContext, FailureKind, RetryError};

/// Identifier of one retry invocation, used for stats lookup and cancellation
pub type RetryId = Uuid;

/// Outcome of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOutcome {
    Success,
    Failed,
    Exhausted,
    Cancelled,
}

/// Information about one attempt of a retried operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    /// Delay scheduled after this attempt (zero unless the attempt failed and another follows)
    pub delay: Duration,
    pub outcome: RetryOutcome,
    /// Text of the captured failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl RetryAttempt {
    fn new(attempt_number: u32, outcome: RetryOutcome) -> Self {
        Self {
            attempt_number,
            timestamp: Utc::now(),
            delay: Duration::ZERO,
            outcome,
            error: None,
            failure_kind: None,
        }
    }

    fn with_failure(mut self, error: impl Display, kind: FailureKind) -> Self {
        self.error = Some(error.to_string());
        self.failure_kind = Some(kind);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Retry policy for a unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (at least 1)
    pub max_attempts: u32,
    /// Base delay handed to the backoff strategy
    pub base_delay: Duration,
    pub backoff: BackoffStrategy,
    /// Wall-clock budget checked before each attempt
    pub timeout: Option<Duration>,
    /// Failure kinds worth another attempt
    pub retry_on: Vec<FailureKind>,
    /// Failure kinds that end the invocation at once; wins over `retry_on`
    pub stop_on: Vec<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff: BackoffStrategy::default(),
            timeout: None,
            retry_on: vec![FailureKind::Any],
            stop_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Policy for transient transport failures
    pub fn network() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff: BackoffStrategy::exponential(2.0, Duration::from_secs(30)),
            timeout: None,
            retry_on: vec![
                FailureKind::Connection,
                FailureKind::Timeout,
                FailureKind::Dns,
                FailureKind::Http,
                FailureKind::Io,
            ],
            stop_on: Vec::new(),
        }
    }

    /// Policy for PAC evaluation hiccups
    pub fn pac() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            backoff: BackoffStrategy::fixed(Duration::from_millis(500)),
            timeout: None,
            retry_on: vec![FailureKind::Validation, FailureKind::Other],
            stop_on: Vec::new(),
        }
    }

    /// Policy for upstream proxy connection failures
    pub fn proxy() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff: BackoffStrategy::exponential(1.5, Duration::from_secs(15)),
            timeout: None,
            retry_on: vec![
                FailureKind::Connection,
                FailureKind::Timeout,
                FailureKind::Io,
            ],
            stop_on: Vec::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    pub fn stop_on(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.stop_on = kinds.into_iter().collect();
        self
    }

    fn stops_on(&self, kind: FailureKind) -> bool {
        self.stop_on.iter().any(|entry| entry.matches(kind))
    }

    fn retries_on(&self, kind: FailureKind) -> bool {
        self.retry_on.iter().any(|entry| entry.matches(kind))
    }
}

/// Attempt history of one invocation
#[derive(Debug, Clone, Serialize)]
pub struct RetryStats {
    pub retry_id: RetryId,
    pub operation: String,
    pub attempts: usize,
    pub total_delay: Duration,
    pub success: bool,
    pub attempts_detail: Vec<RetryAttempt>,
}

/// Aggregate view over every tracked invocation
#[derive(Debug, Clone, Serialize)]
pub struct RetrySummary {
    pub total_retries: usize,
    pub total_attempts: usize,
    pub successful_retries: usize,
    pub success_rate: f64,
    pub active_retries: usize,
}

#[derive(Debug)]
struct InvocationLog {
    operation: String,
    attempts: Vec<RetryAttempt>,
}

impl InvocationLog {
    fn stats(&self, retry_id: RetryId) -> RetryStats {
        RetryStats {
            retry_id,
            operation: self.operation.clone(),
            attempts: self.attempts.len(),
            total_delay: self.attempts.iter().map(|a| a.delay).sum(),
            success: self
                .attempts
                .iter()
                .any(|a| a.outcome == RetryOutcome::Success),
            attempts_detail: self.attempts.clone(),
        }
    }
}

/// Bounded FIFO of invocation histories
#[derive(Debug)]
struct RetryBook {
    order: VecDeque<RetryId>,
    invocations: HashMap<RetryId, InvocationLog>,
    capacity: usize,
}

impl RetryBook {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            invocations: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn open(&mut self, id: RetryId, operation: &str) {
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.invocations.remove(&oldest);
            }
        }
        self.order.push_back(id);
        self.invocations.insert(
            id,
            InvocationLog {
                operation: operation.to_string(),
                attempts: Vec::new(),
            },
        );
    }

    fn record(&mut self, id: RetryId, attempt: RetryAttempt) {
        if let Some(log) = self.invocations.get_mut(&id) {
            log.attempts.push(attempt);
        }
    }
}

/// Executes units of work under a [`RetryPolicy`].
///
/// Clones share the same invocation registry, so a clone handed to another
/// task can cancel or inspect retries started from the original.
#[derive(Clone)]
pub struct RetryManager {
    default_policy: RetryPolicy,
    /// Cancellation tokens of in-flight invocations
    active: Arc<DashMap<RetryId, CancellationToken>>,
    book: Arc<Mutex<RetryBook>>,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryManager {
    /// Create a retry manager with the default policy
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    /// Create a retry manager with a custom default policy
    pub fn with_policy(default_policy: RetryPolicy) -> Self {
        Self::with_capacity(default_policy, RetryConfig::default().stats_capacity)
    }

    /// Create a retry manager keeping at most `capacity` invocation histories
    pub fn with_capacity(default_policy: RetryPolicy, capacity: usize) -> Self {
        Self {
            default_policy,
            active: Arc::new(DashMap::new()),
            book: Arc::new(Mutex::new(RetryBook::new(capacity))),
        }
    }

    /// Create a retry manager from the retry configuration section
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::with_capacity(config.policy(), config.stats_capacity)
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Execute `work` with retries, returning its value or the final failure
    pub async fn retry<T, E, F, Fut>(
        &self,
        operation: &str,
        policy: Option<&RetryPolicy>,
        work: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.retry_with_token(operation, policy, CancellationToken::new(), work)
            .await
    }

    /// Same as [`RetryManager::retry`], logging the caller's context with each attempt
    pub async fn retry_with_context<T, E, F, Fut>(
        &self,
        operation: &str,
        policy: Option<&RetryPolicy>,
        context: &ErrorContext,
        work: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        debug!(operation, context = ?context, "Starting retry with context");
        self.retry(operation, policy, work).await
    }

    /// Execute `work` with retries, stopping early once `token` is cancelled
    pub async fn retry_with_token<T, E, F, Fut>(
        &self,
        operation: &str,
        policy: Option<&RetryPolicy>,
        token: CancellationToken,
        work: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let id = Uuid::new_v4();
        self.run(id, token, operation, policy, work).await
    }

    /// Run the retry loop on a separate task.
    ///
    /// Completion is delivered to `callback` only. The returned id can be
    /// passed to [`RetryManager::cancel`].
    pub fn retry_async<T, E, F, Fut, C>(
        &self,
        operation: impl Into<String>,
        policy: Option<RetryPolicy>,
        work: F,
        callback: C,
    ) -> RetryId
    where
        T: Send + 'static,
        E: Classify + Display + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        C: FnOnce(Result<T, RetryError<E>>) + Send + 'static,
    {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        // Registered before spawning so an immediate cancel is not lost
        self.active.insert(id, token.clone());

        let manager = self.clone();
        let operation = operation.into();
        tokio::spawn(async move {
            let result = manager
                .run(id, token, &operation, policy.as_ref(), work)
                .await;
            callback(result);
        });

        id
    }

    /// Request cooperative cancellation of an in-flight invocation
    pub fn cancel(&self, id: &RetryId) -> bool {
        match self.active.get(id) {
            Some(token) => {
                token.cancel();
                info!(retry_id = %id, "Retry cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Ids of invocations that are still running
    pub fn active_retries(&self) -> Vec<RetryId> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    /// Attempt history of one invocation
    pub async fn get_retry_stats(&self, id: &RetryId) -> Option<RetryStats> {
        let book = self.book.lock().await;
        book.invocations.get(id).map(|log| log.stats(*id))
    }

    /// Attempt histories of every tracked invocation of `operation`, oldest first
    pub async fn get_operation_stats(&self, operation: &str) -> Vec<RetryStats> {
        let book = self.book.lock().await;
        book.order
            .iter()
            .filter_map(|id| {
                book.invocations
                    .get(id)
                    .filter(|log| log.operation == operation)
                    .map(|log| log.stats(*id))
            })
            .collect()
    }

    /// Aggregate statistics across tracked invocations
    pub async fn summary(&self) -> RetrySummary {
        let book = self.book.lock().await;
        let total_retries = book.invocations.len();
        let total_attempts = book.invocations.values().map(|l| l.attempts.len()).sum();
        let successful_retries = book
            .invocations
            .values()
            .filter(|l| l.attempts.iter().any(|a| a.outcome == RetryOutcome::Success))
            .count();

        RetrySummary {
            total_retries,
            total_attempts,
            successful_retries,
            success_rate: if total_retries > 0 {
                successful_retries as f64 / total_retries as f64
            } else {
                0.0
            },
            active_retries: self.active.len(),
        }
    }

    async fn run<T, E, F, Fut>(
        &self,
        id: RetryId,
        token: CancellationToken,
        operation: &str,
        policy: Option<&RetryPolicy>,
        work: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let policy = policy.unwrap_or(&self.default_policy);
        self.active.insert(id, token.clone());
        self.book.lock().await.open(id, operation);

        let result = self
            .execute_with_retry(id, &token, operation, policy, work)
            .await;

        self.active.remove(&id);
        result
    }

    async fn record(&self, id: RetryId, attempt: RetryAttempt) {
        self.book.lock().await.record(id, attempt);
    }

    async fn execute_with_retry<T, E, F, Fut>(
        &self,
        id: RetryId,
        token: &CancellationToken,
        operation: &str,
        policy: &RetryPolicy,
        mut work: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let max_attempts = policy.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            if token.is_cancelled() {
                info!(operation, attempt, "Retry cancelled before attempt");
                self.record(id, RetryAttempt::new(attempt, RetryOutcome::Cancelled))
                    .await;
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                    attempts: attempt - 1,
                });
            }

            if let Some(timeout) = policy.timeout {
                let elapsed = started.elapsed();
                if elapsed > timeout {
                    warn!(
                        operation,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Retry timed out"
                    );
                    self.record(
                        id,
                        RetryAttempt::new(attempt, RetryOutcome::Cancelled)
                            .with_failure("timed out", FailureKind::Timeout),
                    )
                    .await;
                    return Err(RetryError::TimedOut {
                        operation: operation.to_string(),
                        elapsed,
                    });
                }
            }

            debug!(operation, attempt, max_attempts, "Attempting operation");

            let err = match work().await {
                Ok(value) => {
                    self.record(id, RetryAttempt::new(attempt, RetryOutcome::Success))
                        .await;
                    if attempt > 1 {
                        info!(operation, attempt, "Operation succeeded after {} attempts", attempt);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let kind = err.failure_kind();

            if policy.stops_on(kind) {
                info!(operation, attempt, error = %err, kind = %kind, "Stopping retry on stop-listed failure");
                self.record(
                    id,
                    RetryAttempt::new(attempt, RetryOutcome::Cancelled).with_failure(&err, kind),
                )
                .await;
                return Err(RetryError::Operation {
                    error: err,
                    attempts: attempt,
                });
            }

            if !policy.retries_on(kind) {
                info!(operation, attempt, error = %err, kind = %kind, "Not retrying non-retryable failure");
                self.record(
                    id,
                    RetryAttempt::new(attempt, RetryOutcome::Cancelled).with_failure(&err, kind),
                )
                .await;
                return Err(RetryError::Operation {
                    error: err,
                    attempts: attempt,
                });
            }

            if attempt >= max_attempts {
                error!(
                    operation,
                    attempt,
                    error = %err,
                    "Operation failed after {} attempts",
                    attempt
                );
                self.record(
                    id,
                    RetryAttempt::new(attempt, RetryOutcome::Exhausted).with_failure(&err, kind),
                )
                .await;
                return Err(RetryError::Operation {
                    error: err,
                    attempts: attempt,
                });
            }

            let delay = policy.backoff.get_delay(attempt, policy.base_delay);
            warn!(
                operation,
                attempt,
                max_attempts,
                error = %err,
                retry_after_ms = delay.as_millis() as u64,
                "Operation failed, retrying"
            );
            self.record(
                id,
                RetryAttempt::new(attempt, RetryOutcome::Failed)
                    .with_failure(&err, kind)
                    .with_delay(delay),
            )
            .await;

            let cancelled = tokio::select! {
                _ = sleep(delay) => false,
                _ = token.cancelled() => true,
            };

            if cancelled {
                info!(operation, attempt, "Retry cancelled during backoff");
                self.record(id, RetryAttempt::new(attempt + 1, RetryOutcome::Cancelled))
                    .await;
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                    attempts: attempt,
                });
            }
        }
    }
}
