//! Activity retry policies and the orchestration-side retry loop.
//!
//! Retries are driven from orchestration code: every attempt is its own
//! scheduled activity and every backoff is a durable timer, so a retry
//! sequence survives restarts and replays exactly like any other step.
use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::_typed_codec::{Codec, Json};
use crate::{OrchestrationContext, durable_debug, durable_warn};

/// Upper bound on attempts for one logical activity call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxAttempts {
    Unbounded,
    Limited(u32),
}

/// Exponential backoff retry policy.
///
/// The delay after failed attempt `n` is
/// `min(initial_interval * backoff_coefficient^(n-1), maximum_interval)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: MaxAttempts,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: MaxAttempts::Unbounded,
        }
    }
}

impl RetryPolicy {
    /// Default backoff, retrying until success or a non-retryable failure.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Default backoff with at most `max_attempts` attempts in total.
    ///
    /// # Panics
    /// Panics if `max_attempts` is 0.
    pub fn bounded(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            maximum_attempts: MaxAttempts::Limited(max_attempts),
            ..Self::default()
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = interval;
        self
    }

    /// Delay to wait after attempt number `attempt` (1-based) has failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);
        let secs = (self.initial_interval.as_secs_f64() * factor).min(self.maximum_interval.as_secs_f64());
        if secs.is_finite() && secs >= 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            self.maximum_interval
        }
    }

    /// Whether another attempt may start after `attempts_made` failures.
    pub fn allows_another_attempt(&self, attempts_made: u32) -> bool {
        match self.maximum_attempts {
            MaxAttempts::Unbounded => true,
            MaxAttempts::Limited(max) => attempts_made < max,
        }
    }
}

/// Per-call options for `OrchestrationContext::call_activity`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    /// Wall-clock limit for a single attempt, enforced by the worker.
    pub start_to_close_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close_timeout: Some(Duration::from_secs(10)),
            retry: RetryPolicy::default(),
        }
    }
}

impl ActivityOptions {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    NonRetryable,
    Timeout,
}

/// Failure reported by an activity. Travels through history as JSON in
/// `Event::ActivityFailed::error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub attempts: u32,
}

impl fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Retryable => write!(f, "{}", self.message)?,
            FailureKind::NonRetryable => write!(f, "non-retryable: {}", self.message)?,
            FailureKind::Timeout => write!(f, "timeout: {}", self.message)?,
        }
        if self.attempts > 1 {
            write!(f, " (after {} attempts)", self.attempts)?;
        }
        Ok(())
    }
}

impl std::error::Error for ActivityFailure {}

impl ActivityFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
            attempts: 0,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NonRetryable,
            message: message.into(),
            attempts: 0,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
            attempts: 0,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, FailureKind::NonRetryable)
    }

    fn after_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }

    /// Decode a wire error. Plain strings from handlers that do not speak the
    /// JSON form are treated as retryable.
    pub fn from_wire(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self::retryable(raw))
    }
}

impl From<String> for ActivityFailure {
    fn from(message: String) -> Self {
        Self::retryable(message)
    }
}

impl OrchestrationContext {
    /// Invoke an activity with timeout and retry. Each attempt is a separate
    /// scheduled activity; backoff waits are durable timers.
    pub async fn call_activity(
        &self,
        name: &str,
        input: impl Into<String>,
        options: &ActivityOptions,
    ) -> Result<String, ActivityFailure> {
        let input = input.into();
        let mut attempt: u32 = 1;
        loop {
            let outcome = self
                .schedule_activity_with_timeout(name, input.clone(), options.start_to_close_timeout)
                .into_activity()
                .await;
            let failure = match outcome {
                Ok(result) => return Ok(result),
                Err(raw) => ActivityFailure::from_wire(&raw),
            };
            if !failure.is_retryable() || !options.retry.allows_another_attempt(attempt) {
                durable_warn!(self, activity = name, attempt, error = %failure, "activity failed; giving up");
                return Err(failure.after_attempts(attempt));
            }
            let delay = options.retry.delay_for_attempt(attempt);
            durable_debug!(
                self,
                activity = name,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %failure,
                "activity failed; retrying"
            );
            if !delay.is_zero() {
                self.schedule_timer(delay).into_timer().await;
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Typed wrapper over `call_activity`. Encoding and decoding problems are
    /// reported as non-retryable failures.
    pub async fn call_activity_typed<In, Out>(
        &self,
        name: &str,
        input: &In,
        options: &ActivityOptions,
    ) -> Result<Out, ActivityFailure>
    where
        In: Serialize + ?Sized,
        Out: DeserializeOwned,
    {
        let payload = Json::encode(input).map_err(|e| ActivityFailure::non_retryable(format!("encode {name} input: {e}")))?;
        let raw = self.call_activity(name, payload, options).await?;
        Json::decode::<Out>(&raw).map_err(|e| ActivityFailure::non_retryable(format!("decode {name} output: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(100));
        assert_eq!(policy.delay_for_attempt(10_000), Duration::from_secs(100));
    }

    #[test]
    fn maximum_interval_below_initial_wins() {
        let policy = RetryPolicy::default()
            .with_initial_interval(Duration::from_secs(5))
            .with_maximum_interval(Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
    }

    #[test]
    fn bounded_policy_counts_attempts() {
        let policy = RetryPolicy::bounded(5);
        assert!(policy.allows_another_attempt(4));
        assert!(!policy.allows_another_attempt(5));
        assert!(RetryPolicy::unbounded().allows_another_attempt(u32::MAX));
    }

    #[test]
    #[should_panic(expected = "max_attempts must be at least 1")]
    fn bounded_zero_panics() {
        let _ = RetryPolicy::bounded(0);
    }

    #[test]
    fn failures_decode_from_plain_strings() {
        let f = ActivityFailure::from_wire("connection reset");
        assert_eq!(f.kind, FailureKind::Retryable);
        assert_eq!(f.message, "connection reset");

        let wire = ActivityFailure::non_retryable("bad input").to_wire();
        let back = ActivityFailure::from_wire(&wire);
        assert!(!back.is_retryable());
        assert_eq!(back.to_string(), "non-retryable: bad input");
    }

    #[test]
    fn timeouts_are_retryable() {
        assert!(ActivityFailure::timeout("slow").is_retryable());
    }
}
