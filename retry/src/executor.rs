//! Timeout + retry + circuit breaker around a single logical request.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::warn;

use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::RequestError;
use crate::policy;
use crate::policy::RetryConfig;

/// Per-attempt timeout applied when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type ShouldRetryFn = dyn Fn(&RequestError, u32) -> bool + Send + Sync;
type OnRetryFn = dyn Fn(u32, &RequestError) + Send + Sync;
type OnMaxRetriesFn = dyn Fn(&RequestError) + Send + Sync;

/// Knobs for one `execute_with_retry` call.
pub struct RetryOptions {
    pub config: RetryConfig,
    pub timeout: Duration,
    should_retry: Option<Box<ShouldRetryFn>>,
    on_retry: Option<Box<OnRetryFn>>,
    on_max_retries: Option<Box<OnMaxRetriesFn>>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("on_max_retries", &self.on_max_retries.is_some())
            .finish()
    }
}

impl RetryOptions {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            should_retry: None,
            on_retry: None,
            on_max_retries: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the default kind-based retry predicate.
    pub fn with_should_retry(
        mut self,
        f: impl Fn(&RequestError, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Box::new(f));
        self
    }

    /// Called with the 1-based retry number before each backoff sleep.
    pub fn with_on_retry(mut self, f: impl Fn(u32, &RequestError) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(f));
        self
    }

    /// Called once when the attempt budget is spent.
    pub fn with_on_max_retries(mut self, f: impl Fn(&RequestError) + Send + Sync + 'static) -> Self {
        self.on_max_retries = Some(Box::new(f));
        self
    }

    fn retryable(&self, err: &RequestError, attempt: u32) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(err, attempt),
            None => policy::should_retry(err, attempt, &self.config),
        }
    }
}

/// Executes requests with bounded retries behind a shared circuit breaker.
///
/// The whole retry loop counts as one breaker call: a request that succeeds
/// on its third attempt is a single success.
#[derive(Debug, Clone)]
pub struct ResilientRequestExecutor {
    breaker: Arc<CircuitBreaker>,
}

impl ResilientRequestExecutor {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent. The last error is returned as produced.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        operation: F,
        options: &RetryOptions,
    ) -> Result<T, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        self.breaker
            .execute(|| retry_loop(operation, options))
            .await
    }
}

async fn retry_loop<F, Fut, T>(mut operation: F, options: &RetryOptions) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let outcome = match tokio::time::timeout(options.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(RequestError::timeout(options.timeout)),
        };

        let err = match outcome {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "request succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if attempt >= options.config.max_retries {
            warn!(attempts = attempt + 1, error = %err, "retry budget exhausted");
            if let Some(hook) = &options.on_max_retries {
                hook(&err);
            }
            return Err(err);
        }
        if !options.retryable(&err, attempt) {
            debug!(attempt, error = %err, "permanent error, not retrying");
            return Err(err);
        }

        let delay = policy::delay_for(&err, attempt, &options.config);
        attempt += 1;
        debug!(
            retry = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying request"
        );
        if let Some(hook) = &options.on_retry {
            hook(attempt, &err);
        }
        tokio::time::sleep(delay).await;
    }
}
