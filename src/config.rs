//! Payroll worker configuration.
//!
//! Built-in defaults can be overridden from a TOML file. Every key is
//! optional; omitted keys keep their default:
//!
//! ```toml
//! stuck_payments = "fail"          # or "park" (default)
//!
//! [polling]
//! fps_poll_interval_ms = 60000
//! payment_poll_interval_ms = 10000
//!
//! [activities.pay_details_push]
//! timeout_ms = 10000               # 0 disables the per-call timeout
//! initial_interval_ms = 1000
//! backoff_coefficient = 2.0
//! maximum_interval_ms = 100000
//! max_attempts = 5                 # 0 retries forever
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::retry::{ActivityOptions, MaxAttempts, RetryPolicy};

/// What the payment fan-out does once a payment has failed for good.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StuckPaymentPolicy {
    /// Keep the run open until an operator cancels it.
    #[default]
    Park,
    /// Fail the payments run, listing the payments that did not finish.
    Fail,
}

/// Effective settings for the payroll orchestrations.
#[derive(Debug, Clone, PartialEq)]
pub struct PayrollConfig {
    /// Eligibility, submission, discovery, payment status and reconciliation.
    pub default_activity: ActivityOptions,
    pub fps_check: ActivityOptions,
    /// Mark-successful and send-documents notifications.
    pub notification: ActivityOptions,
    pub schedule_payment: ActivityOptions,
    pub pay_details_push: ActivityOptions,
    pub fps_poll_interval: Duration,
    pub payment_poll_interval: Duration,
    pub stuck_payments: StuckPaymentPolicy,
}

impl Default for PayrollConfig {
    fn default() -> Self {
        let status_checks =
            ActivityOptions::new(RetryPolicy::default().with_maximum_interval(Duration::from_secs(1)));
        Self {
            default_activity: ActivityOptions::default(),
            fps_check: status_checks.clone(),
            notification: status_checks,
            schedule_payment: ActivityOptions::default(),
            pay_details_push: ActivityOptions::new(RetryPolicy::bounded(5)),
            fps_poll_interval: Duration::from_secs(60),
            payment_poll_interval: Duration::from_secs(10),
            stuck_payments: StuckPaymentPolicy::Park,
        }
    }
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// On-disk form. Durations are integer milliseconds.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub stuck_payments: Option<StuckPaymentPolicy>,
    #[serde(default)]
    pub polling: PollingSection,
    #[serde(default)]
    pub activities: ActivitiesSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PollingSection {
    pub fps_poll_interval_ms: Option<u64>,
    pub payment_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ActivitiesSection {
    pub default: Option<ActivityOptionsFile>,
    pub fps_check: Option<ActivityOptionsFile>,
    pub notification: Option<ActivityOptionsFile>,
    pub schedule_payment: Option<ActivityOptionsFile>,
    pub pay_details_push: Option<ActivityOptionsFile>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ActivityOptionsFile {
    pub timeout_ms: Option<u64>,
    pub initial_interval_ms: Option<u64>,
    pub backoff_coefficient: Option<f64>,
    pub maximum_interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

impl ActivityOptionsFile {
    fn apply(&self, section: &str, mut base: ActivityOptions) -> Result<ActivityOptions, ConfigError> {
        if let Some(ms) = self.timeout_ms {
            base.start_to_close_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = self.initial_interval_ms {
            base.retry.initial_interval = Duration::from_millis(ms);
        }
        if let Some(c) = self.backoff_coefficient {
            if !c.is_finite() || c < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "activities.{section}.backoff_coefficient must be >= 1.0, got {c}"
                )));
            }
            base.retry.backoff_coefficient = c;
        }
        if let Some(ms) = self.maximum_interval_ms {
            base.retry.maximum_interval = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_attempts {
            base.retry.maximum_attempts = if n == 0 { MaxAttempts::Unbounded } else { MaxAttempts::Limited(n) };
        }
        Ok(base)
    }
}

fn overlay(
    section: &str,
    file: Option<&ActivityOptionsFile>,
    base: ActivityOptions,
) -> Result<ActivityOptions, ConfigError> {
    match file {
        Some(f) => f.apply(section, base),
        None => Ok(base),
    }
}

impl PayrollConfig {
    /// Overlay a parsed config file on the built-in defaults.
    pub fn from_file_contents(file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let a = &file.activities;
        let default_activity = overlay("default", a.default.as_ref(), defaults.default_activity)?;
        Ok(Self {
            fps_check: overlay("fps_check", a.fps_check.as_ref(), defaults.fps_check)?,
            notification: overlay("notification", a.notification.as_ref(), defaults.notification)?,
            schedule_payment: overlay("schedule_payment", a.schedule_payment.as_ref(), defaults.schedule_payment)?,
            pay_details_push: overlay("pay_details_push", a.pay_details_push.as_ref(), defaults.pay_details_push)?,
            default_activity,
            fps_poll_interval: file
                .polling
                .fps_poll_interval_ms
                .map_or(defaults.fps_poll_interval, Duration::from_millis),
            payment_poll_interval: file
                .polling
                .payment_poll_interval_ms
                .map_or(defaults.payment_poll_interval, Duration::from_millis),
            stuck_payments: file.stuck_payments.unwrap_or(defaults.stuck_payments),
        })
    }

    /// # Errors
    /// Returns `ConfigError::TomlParse` if the TOML is invalid.
    pub fn from_toml_str(toml_content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_content)?;
        Self::from_file_contents(&file)
    }

    /// # Errors
    /// Returns `ConfigError::Io` if the file cannot be read.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Short intervals for local demos and tests.
    #[must_use]
    pub fn fast() -> Self {
        let quick = RetryPolicy::default()
            .with_initial_interval(Duration::from_millis(10))
            .with_maximum_interval(Duration::from_millis(100));
        let options = ActivityOptions::new(quick.clone()).with_timeout(Some(Duration::from_secs(5)));
        Self {
            default_activity: options.clone(),
            fps_check: options.clone(),
            notification: options.clone(),
            schedule_payment: options.clone(),
            pay_details_push: ActivityOptions {
                retry: RetryPolicy {
                    maximum_attempts: MaxAttempts::Limited(5),
                    ..quick
                },
                ..options
            },
            fps_poll_interval: Duration::from_millis(20),
            payment_poll_interval: Duration::from_millis(20),
            stuck_payments: StuckPaymentPolicy::Park,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_keeps_defaults() {
        let cfg = PayrollConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, PayrollConfig::default());
        assert_eq!(cfg.pay_details_push.retry.maximum_attempts, MaxAttempts::Limited(5));
        assert_eq!(cfg.fps_check.retry.maximum_interval, Duration::from_secs(1));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = PayrollConfig::from_toml_str(
            r#"
            stuck_payments = "fail"

            [polling]
            fps_poll_interval_ms = 250

            [activities.schedule_payment]
            timeout_ms = 0
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.stuck_payments, StuckPaymentPolicy::Fail);
        assert_eq!(cfg.fps_poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.payment_poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.schedule_payment.start_to_close_timeout, None);
        assert_eq!(cfg.schedule_payment.retry.maximum_attempts, MaxAttempts::Limited(3));
    }

    #[test]
    fn zero_attempts_means_unbounded() {
        let cfg = PayrollConfig::from_toml_str("[activities.pay_details_push]\nmax_attempts = 0\n").unwrap();
        assert_eq!(cfg.pay_details_push.retry.maximum_attempts, MaxAttempts::Unbounded);
    }

    #[test]
    fn rejects_bad_coefficient_and_unknown_keys() {
        let err = PayrollConfig::from_toml_str("[activities.default]\nbackoff_coefficient = 0.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = PayrollConfig::from_toml_str("bogus = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(_)));
    }
}
