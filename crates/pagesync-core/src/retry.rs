//! Bounded retry with exponential backoff.
//!
//! [`RetryingFetcher`] wraps any [`PageFetcher`] and retries transient
//! failures ([`FetchError::is_transient`]) up to a fixed budget. Permanent
//! failures propagate after a single attempt.
//!
//! The delay before retry `n` (0-based) is `min(max_delay, base * multiplier^n)`.
//! With jitter enabled the delay is drawn uniformly from `[delay/2, delay]`.
//!
//! ```rust
//! use std::time::Duration;
//! use pagesync_core::RetryPolicy;
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.backoff(0), Duration::from_secs(1));
//! assert_eq!(policy.backoff(3), Duration::from_secs(8));
//! assert_eq!(policy.backoff(10), Duration::from_secs(30));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::{Error, Page, PageFetcher, PageRequest, QuerySpec, Result};

/// Retry budget and backoff curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
    /// Randomize delays into `[delay/2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Build a policy from configuration.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry `retry` (0-based).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let cap = self.max_delay.as_millis() as f64;
        let exp = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let millis = (base * exp).min(cap);
        if millis.is_finite() {
            Duration::from_millis(millis.max(0.0) as u64)
        } else {
            self.max_delay
        }
    }

    /// Delay actually slept before retry `retry`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn delay(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if !self.jitter {
            return delay;
        }
        let upper = delay.as_millis() as u64;
        let lower = upper / 2;
        if upper == lower {
            return delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(lower..=upper))
    }
}

/// Request and retry counters, shared across tasks.
#[derive(Debug, Default)]
pub struct RetryStats {
    requests: AtomicU64,
    retries: AtomicU64,
}

impl RetryStats {
    /// Network attempts made.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Attempts that were retries of an earlier failure.
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// A [`PageFetcher`] wrapped with a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryingFetcher {
    inner: Arc<dyn PageFetcher>,
    policy: RetryPolicy,
    stats: Arc<RetryStats>,
}

impl RetryingFetcher {
    /// Wrap `inner` with `policy`.
    #[must_use]
    pub fn new(inner: Arc<dyn PageFetcher>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            stats: Arc::new(RetryStats::default()),
        }
    }

    /// Same fetcher and policy with fresh counters.
    #[must_use]
    pub fn with_fresh_stats(&self) -> Self {
        Self::new(Arc::clone(&self.inner), self.policy.clone())
    }

    /// Same fetcher and counters, single attempt.
    #[must_use]
    pub fn without_retries(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: RetryPolicy::no_retries(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Active policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> &RetryStats {
        &self.stats
    }

    /// Fetch one page, retrying transient failures.
    ///
    /// # Errors
    ///
    /// - [`Error::Fetch`] for a permanent failure (no further attempts)
    /// - [`Error::RetryExhausted`] once the retry budget is spent
    /// - [`Error::Cancelled`] if `cancel` fires first
    pub async fn fetch_with_retry(
        &self,
        spec: &QuerySpec,
        request: PageRequest,
        cancel: &CancellationToken,
    ) -> Result<Page> {
        self.fetch_with_attempts(spec, request, cancel).await.0
    }

    /// Like [`fetch_with_retry`](Self::fetch_with_retry), also returning the
    /// number of network attempts made.
    pub async fn fetch_with_attempts(
        &self,
        spec: &QuerySpec,
        request: PageRequest,
        cancel: &CancellationToken,
    ) -> (Result<Page>, u32) {
        let mut attempts: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return (Err(Error::Cancelled), attempts);
            }

            attempts += 1;
            self.stats.requests.fetch_add(1, Ordering::Relaxed);
            if attempts > 1 {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
            }

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return (Err(Error::Cancelled), attempts),
                outcome = self.inner.fetch(spec, request) => outcome,
            };

            let err = match outcome {
                Ok(page) => return (Ok(page), attempts),
                Err(err) => err,
            };

            if !err.is_transient() {
                debug!("offset {}: permanent {} failure: {}", request.offset, err.kind(), err);
                return (Err(Error::Fetch(err)), attempts);
            }

            let retry = attempts - 1;
            if retry >= self.policy.max_retries {
                warn!(
                    "offset {}: giving up after {} attempts: {}",
                    request.offset, attempts, err
                );
                return (Err(Error::RetryExhausted { attempts, last: err }), attempts);
            }

            let delay = self.policy.delay(retry);
            warn!(
                "offset {}: {} (attempt {}/{}), retrying in {:?}",
                request.offset,
                err,
                attempts,
                self.policy.max_retries + 1,
                delay
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return (Err(Error::Cancelled), attempts),
                () = tokio::time::sleep(delay) => {},
            }
        }
    }
}
