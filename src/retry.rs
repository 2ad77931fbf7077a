//! Predicate-driven, strategy-based retry for any transport.
//!
//! The retry policy re-enters the rest of the chain once per attempt. After
//! each failed attempt it consults a [`Predicate`] (should we try again?) and
//! an ordered list of [`DelayStrategy`] values (how long to wait?). The first
//! strategy returning a delay wins, which lets a rate-limit header override
//! the base backoff. Sleeps honor the context's cancellation token.
//!
//! The predicate is transport-neutral; [`http_predicate`] wraps the common
//! HTTP rule (retry on error, on configured statuses, and on 5xx).
//!
//! # Examples
//!
//! ```rust
//! use ika::retry::{RetryPolicy, http_predicate};
//! use ika::retry::backoff::ExponentialBackoff;
//! use ika::retry::rate_limit::RetryAfter;
//!
//! let retry = RetryPolicy::builder()
//!     .predicate(http_predicate([429]))
//!     .strategy(RetryAfter::new())
//!     .strategy(ExponentialBackoff::new().jitter(false))
//!     .tries(4)
//!     .build();
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::context::Context;
use crate::error::{Error, ErrorCode, Result};
use crate::introspect::{Meta, MetaKind};
use crate::policy::{IntoPolicy, Next, Policy};
use crate::response::Response;
use crate::slot::{Slot, SlotKind};

pub mod backoff;
pub mod rate_limit;

type PredicateFn =
    Arc<dyn Fn(Option<&Response>, Option<&Error>, u32, &Context) -> bool + Send + Sync>;

/// Decides whether a finished attempt should be retried.
#[derive(Clone)]
pub struct Predicate {
    func: PredicateFn,
    meta: Meta,
}

impl Predicate {
    /// Wraps a closure as a named predicate.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Option<&Response>, Option<&Error>, u32, &Context) -> bool + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            meta: Meta::new(name, MetaKind::Predicate),
        }
    }

    /// Records a configuration option on the predicate's metadata.
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta = self.meta.with_option(key, value);
        self
    }

    /// Evaluates the predicate.
    pub fn check(
        &self,
        response: Option<&Response>,
        error: Option<&Error>,
        attempt: u32,
        ctx: &Context,
    ) -> bool {
        (self.func)(response, error, attempt, ctx)
    }

    /// Introspection metadata.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }
}

/// HTTP retry rule: retry when the attempt errored, when the status is in
/// `retriable`, or when the status is 5xx.
pub fn http_predicate<I: IntoIterator<Item = u16>>(retriable: I) -> Predicate {
    let statuses: HashSet<u16> = retriable.into_iter().collect();
    let mut listed: Vec<u16> = statuses.iter().copied().collect();
    listed.sort_unstable();
    Predicate::new("http", move |response, error, _attempt, _ctx| {
        if error.is_some() {
            return true;
        }
        match response {
            Some(resp) => {
                let code = resp.status().as_u16();
                statuses.contains(&code) || code >= 500
            }
            None => false,
        }
    })
    .with_option("statuses", json!(listed))
}

/// Computes how long to wait before the next attempt.
///
/// Returning `None` defers to the next strategy in the list; `None` from all
/// strategies (or a zero duration) means no wait.
pub trait DelayStrategy: Send + Sync + 'static {
    /// Delay for the attempt that just finished (zero-indexed).
    fn delay(
        &self,
        response: Option<&Response>,
        error: Option<&Error>,
        attempt: u32,
    ) -> Option<Duration>;

    /// Introspection metadata.
    fn meta(&self) -> Meta {
        Meta::new("strategy", MetaKind::Strategy)
    }
}

type OnRetry = Arc<dyn Fn(u32, Option<&Error>, Option<&Response>) + Send + Sync>;

/// Configured retry loop; convert with [`IntoPolicy`].
pub struct RetryPolicy {
    predicate: Predicate,
    strategies: Vec<Arc<dyn DelayStrategy>>,
    tries: u32,
    on_retry: Option<OnRetry>,
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    predicate: Predicate,
    strategies: Vec<Arc<dyn DelayStrategy>>,
    tries: u32,
    on_retry: Option<OnRetry>,
}

impl RetryPolicyBuilder {
    fn new() -> Self {
        Self {
            predicate: http_predicate([]),
            strategies: Vec::new(),
            tries: 3,
            on_retry: None,
        }
    }

    /// Replaces the retry predicate.
    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Appends a delay strategy; earlier strategies take precedence.
    pub fn strategy(mut self, strategy: impl DelayStrategy) -> Self {
        self.strategies.push(Arc::new(strategy));
        self
    }

    /// Total number of attempts, including the first. Minimum 1.
    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = tries.max(1);
        self
    }

    /// Observer called before each sleep with the upcoming attempt number.
    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, Option<&Error>, Option<&Response>) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            predicate: self.predicate,
            strategies: self.strategies,
            tries: self.tries,
            on_retry: self.on_retry,
        }
    }
}

impl RetryPolicy {
    /// Starts a builder with HTTP defaults (`tries = 3`, 5xx predicate).
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }
}

impl IntoPolicy for RetryPolicy {
    fn into_policy(self) -> Policy {
        let meta = Meta::new("retry", MetaKind::Retry)
            .with_option("tries", json!(self.tries))
            .with_child(self.predicate.meta().clone())
            .with_children(self.strategies.iter().map(|s| s.meta()));
        let cfg = Arc::new(self);

        Policy::new(move |ctx: Context, next: Next| {
            let cfg = cfg.clone();
            async move {
                let mut attempt = 0u32;
                loop {
                    let outcome = next.clone().run(ctx.clone()).await;
                    let last = attempt + 1 >= cfg.tries;

                    let retry = !last && {
                        let (response, error) = split(&outcome);
                        cfg.predicate.check(response, error, attempt, &ctx)
                    };
                    if !retry {
                        if last && outcome.is_err() {
                            tracing::warn!(target: "ika.retry", attempt, "attempts exhausted");
                        }
                        return outcome;
                    }

                    let delay = {
                        let (response, error) = split(&outcome);
                        if let Some(callback) = &cfg.on_retry {
                            callback(attempt + 1, error, response);
                        }
                        cfg.strategies
                            .iter()
                            .find_map(|s| s.delay(response, error, attempt))
                    };

                    if let Some(delay) = delay.filter(|d| !d.is_zero()) {
                        tracing::debug!(
                            target: "ika.retry",
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "backing off"
                        );
                        tokio::select! {
                            _ = ctx.cancel_token().cancelled() => {
                                return Err(Error::new(
                                    ErrorCode::Cancelled,
                                    "retry aborted by cancellation",
                                ));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    attempt += 1;
                }
            }
        })
        .with_slot(Slot::new(SlotKind::Retry, "retry"))
        .with_meta(meta)
    }
}

fn split(outcome: &Result<Response>) -> (Option<&Response>, Option<&Error>) {
    match outcome {
        Ok(response) => (Some(response), None),
        Err(error) => (None, Some(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::backoff::ExponentialBackoff;
    use super::rate_limit::RetryAfter;
    use super::*;
    use http::{HeaderValue, Method, StatusCode};
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::policy::Chain;
    use crate::response::Payload;

    /// Terminal policy that fails `failures` times, then succeeds, recording
    /// the (paused-clock) instant of every attempt.
    fn flaky_terminal(
        failures: u32,
        counter: Arc<AtomicU32>,
        stamps: Arc<parking_lot::Mutex<Vec<tokio::time::Instant>>>,
    ) -> Policy {
        Policy::new(move |_ctx: Context, _next: Next| {
            let counter = counter.clone();
            let stamps = stamps.clone();
            async move {
                stamps.lock().push(tokio::time::Instant::now());
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(Error::new(ErrorCode::Network, "flaky"))
                } else {
                    Ok(Response::new(StatusCode::OK, Payload::Empty))
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_ladder_without_jitter() {
        let counter = Arc::new(AtomicU32::new(0));
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let retry = RetryPolicy::builder()
            .predicate(http_predicate([]))
            .strategy(
                ExponentialBackoff::new()
                    .initial(Duration::from_millis(100))
                    .max(Duration::from_millis(1000))
                    .multiplier(2.0)
                    .jitter(false),
            )
            .tries(4)
            .build();
        let chain = Chain::new(vec![
            retry.into_policy(),
            flaky_terminal(3, counter.clone(), stamps.clone()),
        ]);

        let resp = chain
            .execute(Context::new(Method::GET, "https://example.com"))
            .await
            .unwrap();
        assert!(resp.ok());
        assert_eq!(counter.load(Ordering::SeqCst), 4);

        let stamps = stamps.lock();
        let deltas: Vec<u64> = stamps
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect();
        assert_eq!(deltas, vec![100, 200, 400]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_try_never_sleeps() {
        let counter = Arc::new(AtomicU32::new(0));
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let retry = RetryPolicy::builder()
            .strategy(ExponentialBackoff::new().jitter(false))
            .tries(1)
            .build();
        let chain = Chain::new(vec![
            retry.into_policy(),
            flaky_terminal(5, counter.clone(), stamps.clone()),
        ]);

        let started = tokio::time::Instant::now();
        let err = chain
            .execute(Context::new(Method::GET, "https://example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Network);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_header_beats_backoff() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_inner = counter.clone();
        let terminal = Policy::new(move |_ctx: Context, _next: Next| {
            let counter = counter_inner.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(
                        Response::new(StatusCode::TOO_MANY_REQUESTS, Payload::Empty).with_header(
                            http::header::RETRY_AFTER,
                            HeaderValue::from_static("2"),
                        ),
                    )
                } else {
                    Ok(Response::new(StatusCode::OK, Payload::Empty))
                }
            }
        });

        let retry = RetryPolicy::builder()
            .predicate(http_predicate([429]))
            .strategy(RetryAfter::new())
            .strategy(
                ExponentialBackoff::new()
                    .initial(Duration::from_millis(100))
                    .jitter(false),
            )
            .tries(3)
            .build();
        let chain = Chain::new(vec![retry.into_policy(), terminal]);

        let started = tokio::time::Instant::now();
        let resp = chain
            .execute(Context::new(Method::GET, "https://example.com"))
            .await
            .unwrap();
        assert!(resp.ok());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_false_returns_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_inner = counter.clone();
        let terminal = Policy::new(move |_ctx: Context, _next: Next| {
            let counter = counter_inner.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Response::new(StatusCode::NOT_FOUND, Payload::Empty))
            }
        });
        let retry = RetryPolicy::builder()
            .predicate(http_predicate([429]))
            .strategy(ExponentialBackoff::new().jitter(false))
            .tries(5)
            .build();
        let chain = Chain::new(vec![retry.into_policy(), terminal]);

        let resp = chain
            .execute(Context::new(Method::GET, "https://example.com"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn on_retry_reports_upcoming_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let observed_inner = observed.clone();
        let retry = RetryPolicy::builder()
            .predicate(http_predicate([]))
            .tries(3)
            .on_retry(move |attempt, _error, _response| {
                observed_inner.lock().push(attempt);
            })
            .build();
        let chain = Chain::new(vec![
            retry.into_policy(),
            flaky_terminal(2, counter, stamps),
        ]);

        chain
            .execute(Context::new(Method::GET, "https://example.com"))
            .await
            .unwrap();
        assert_eq!(*observed.lock(), vec![1, 2]);
    }
}
