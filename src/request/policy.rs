//! Retry policy table keyed by error class.
//!
//! # Backoff schedule (defaults)
//!
//! | Retry | Delay |
//! |-------|-------|
//! | 1     | 250ms |
//! | 2     | 500ms |
//! | 3     | 1s    |
//! | ...   | capped at 5s |
//!
//! Rate-limited failures wait for the provider's retry-after when given,
//! each wait and their sum both capped at `max_rate_limit_wait` (10s).

use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{ErrorClass, FetchError};

/// Retry parameters for one error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryRule {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl RetryRule {
  /// `min(base * 2^attempt, max_delay)`
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  RetryAfter(Duration),
  GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  transient: Option<RetryRule>,
  rate_limited: Option<RetryRule>,
  max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&RetryConfig::default())
  }
}

impl RetryPolicy {
  pub fn from_config(config: &RetryConfig) -> Self {
    let rule = RetryRule {
      max_retries: config.max_retries,
      base_delay: Duration::from_millis(config.base_delay_ms),
      max_delay: Duration::from_millis(config.max_delay_ms),
    };
    Self {
      transient: Some(rule),
      rate_limited: Some(rule),
      max_rate_limit_wait: Duration::from_millis(config.max_rate_limit_wait_ms),
    }
  }

  /// A policy that never retries.
  pub fn none() -> Self {
    Self {
      transient: None,
      rate_limited: None,
      max_rate_limit_wait: Duration::ZERO,
    }
  }

  /// Same policy with a different retry budget for every retryable class.
  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    for rule in [&mut self.transient, &mut self.rate_limited]
      .into_iter()
      .flatten()
    {
      rule.max_retries = max_retries;
    }
    self
  }

  pub fn rule(&self, class: ErrorClass) -> Option<&RetryRule> {
    match class {
      ErrorClass::Transient => self.transient.as_ref(),
      ErrorClass::RateLimited => self.rate_limited.as_ref(),
      ErrorClass::Permanent | ErrorClass::Aborted => None,
    }
  }

  pub fn max_rate_limit_wait(&self) -> Duration {
    self.max_rate_limit_wait
  }

  /// Decide whether attempt number `attempt` (0-based retry index) may run.
  ///
  /// `rate_limit_waited` is the time already spent waiting out rate limits
  /// for this request.
  pub fn decide(
    &self,
    error: &FetchError,
    attempt: u32,
    rate_limit_waited: Duration,
  ) -> RetryDecision {
    let Some(rule) = self.rule(error.class()) else {
      return RetryDecision::GiveUp;
    };
    if attempt >= rule.max_retries {
      return RetryDecision::GiveUp;
    }

    match error {
      FetchError::RateLimited { retry_after } => {
        let wait = retry_after
          .unwrap_or_else(|| rule.backoff(attempt))
          .min(self.max_rate_limit_wait);
        if rate_limit_waited + wait > self.max_rate_limit_wait {
          RetryDecision::GiveUp
        } else {
          RetryDecision::RetryAfter(wait)
        }
      }
      _ => RetryDecision::RetryAfter(rule.backoff(attempt)),
    }
  }
}
