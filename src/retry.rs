//! Retry policy and the loop that applies it.
//!
//! A failed attempt is retried when the policy still has budget, the
//! failure is retryable, and the backoff delay fits within the wall-clock
//! ceiling measured from the start of the first attempt.
//!
//! ```text
//! delay(n) = min(min_timeout * factor^(n - 1), max_timeout)   n = 1, 2, ...
//! ```
//!
//! With defaults the delays are 1s, 2s, 4s, 8s.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use tokio::time::{sleep, Instant};

use crate::{Error, NetworkErrorKind, Result};

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRIES: usize = 4;

/// Default ceiling on total time spent across all attempts.
pub const DEFAULT_MAX_RETRY_TIME: Duration = Duration::from_secs(30);

const DEFAULT_MIN_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_FACTOR: f64 = 2.0;

/// Statuses retried by default.
pub const RETRY_STATUS_CODES: [u16; 7] = [408, 413, 429, 500, 502, 503, 504];

/// Methods retried on HTTP failures by default.
pub fn default_retry_methods() -> Vec<Method> {
    vec![
        Method::DELETE,
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::PUT,
        Method::TRACE,
    ]
}

/// Custom decision for failures that are neither aborts, HTTP failures nor
/// unaddressable targets.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    retries: usize,
    max_retry_time: Duration,
    methods: Vec<Method>,
    status_codes: BTreeSet<u16>,
    min_timeout: Duration,
    max_timeout: Duration,
    factor: f64,
    should_retry: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retries", &self.retries)
            .field("max_retry_time", &self.max_retry_time)
            .field("methods", &self.methods)
            .field("status_codes", &self.status_codes)
            .field("min_timeout", &self.min_timeout)
            .field("max_timeout", &self.max_timeout)
            .field("factor", &self.factor)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            max_retry_time: DEFAULT_MAX_RETRY_TIME,
            methods: default_retry_methods(),
            status_codes: RETRY_STATUS_CODES.into_iter().collect(),
            min_timeout: DEFAULT_MIN_TIMEOUT,
            max_timeout: Duration::MAX,
            factor: DEFAULT_FACTOR,
            should_retry: None,
        }
    }
}

/// A bare number sets the retry budget and keeps every other default.
impl From<usize> for RetryPolicy {
    fn from(retries: usize) -> Self {
        Self::default().retries(retries)
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self::from(0)
    }

    /// Maximum number of retries after the first attempt.
    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Ceiling on the total time spent across all attempts.
    pub fn max_retry_time(mut self, max_retry_time: Duration) -> Self {
        self.max_retry_time = max_retry_time;
        self
    }

    /// Methods whose HTTP failures may be retried.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Statuses whose HTTP failures may be retried.
    pub fn status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.status_codes = codes.into_iter().collect();
        self
    }

    /// Delay before the first retry.
    pub fn min_timeout(mut self, min_timeout: Duration) -> Self {
        self.min_timeout = min_timeout;
        if self.max_timeout < min_timeout {
            self.max_timeout = min_timeout;
        }
        self
    }

    /// Cap on a single backoff delay.
    pub fn max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout.max(self.min_timeout);
        self
    }

    /// Backoff growth factor, at least `1.0`.
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Decides timeouts, network failures and other errors.
    ///
    /// Aborts, unknown schemes and HTTP failures never reach the predicate.
    pub fn should_retry(
        mut self,
        predicate: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// The retry budget.
    pub fn retry_count(&self) -> usize {
        self.retries
    }

    /// The total time ceiling.
    pub fn ceiling(&self) -> Duration {
        self.max_retry_time
    }

    /// Whether HTTP failures of `method` may be retried.
    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    /// Whether HTTP failures with `status` may be retried.
    pub fn allows_status(&self, status: u16) -> bool {
        self.status_codes.contains(&status)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: usize) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as usize) as i32;
        let delay = self.min_timeout.as_secs_f64() * self.factor.powi(exponent);
        if !delay.is_finite() || delay >= self.max_timeout.as_secs_f64() {
            return self.max_timeout;
        }
        Duration::try_from_secs_f64(delay).unwrap_or(self.max_timeout)
    }

    /// Whether `error` may be retried, ignoring budget and ceiling.
    pub fn is_retryable(&self, error: &Error) -> bool {
        match error {
            Error::Abort(_) => false,
            Error::Network(network) if network.kind() == NetworkErrorKind::UnknownScheme => false,
            Error::Http(http) => {
                self.allows_method(http.request().method())
                    && self.allows_status(http.status().as_u16())
            }
            other => self
                .should_retry
                .as_ref()
                .map_or(true, |predicate| predicate(other)),
        }
    }

    /// Runs `operation` until it succeeds, fails fatally, or the budget or
    /// ceiling runs out. Attempts are strictly sequential; the callback
    /// receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt > self.retries || !self.is_retryable(&error) {
                return Err(error);
            }

            let delay = self.backoff(attempt);
            let elapsed = started.elapsed();
            if elapsed.saturating_add(delay) > self.max_retry_time {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "retry ceiling of {:?} reached after {} attempts",
                    self.max_retry_time,
                    attempt
                );
                return Err(error);
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(
                "retrying after {} ms (attempt {} failed: {})",
                delay.as_millis(),
                attempt,
                error
            );

            sleep(delay).await;
        }
    }
}
