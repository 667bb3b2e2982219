//! Error taxonomy shared by the orchestration layer.
//!
//! Every outbound operation resolves to one of four [`FetchError`] classes.
//! The class, not the message, decides retry behaviour.

use std::time::Duration;

use thiserror::Error;

/// Classified failure of an outbound operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// Network error or 5xx. Retryable.
  #[error("transient failure: {message}")]
  TransientFailure { message: String },

  /// Provider backpressure (429 or a client-side limiter rejection).
  #[error("rate limited{}", retry_after_suffix(.retry_after))]
  RateLimited { retry_after: Option<Duration> },

  /// 4xx other than 429, validation errors. Never retried.
  #[error("request rejected{}: {message}", code_suffix(.code))]
  PermanentFailure { code: Option<u16>, message: String },

  /// The caller stopped waiting.
  #[error("request aborted")]
  Aborted,
}

/// Retry classification of a [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
  Transient,
  RateLimited,
  Permanent,
  Aborted,
}

impl FetchError {
  pub fn transient(message: impl Into<String>) -> Self {
    Self::TransientFailure {
      message: message.into(),
    }
  }

  pub fn permanent(code: Option<u16>, message: impl Into<String>) -> Self {
    Self::PermanentFailure {
      code,
      message: message.into(),
    }
  }

  pub fn rate_limited(retry_after: Option<Duration>) -> Self {
    Self::RateLimited { retry_after }
  }

  pub fn class(&self) -> ErrorClass {
    match self {
      Self::TransientFailure { .. } => ErrorClass::Transient,
      Self::RateLimited { .. } => ErrorClass::RateLimited,
      Self::PermanentFailure { .. } => ErrorClass::Permanent,
      Self::Aborted => ErrorClass::Aborted,
    }
  }

  /// Whether a mutation failing with this error belongs in the offline queue.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self.class(),
      ErrorClass::Transient | ErrorClass::RateLimited
    )
  }

  /// True for permanent failures that mean the target record is gone.
  pub fn is_missing_target(&self) -> bool {
    matches!(
      self,
      Self::PermanentFailure {
        code: Some(404 | 410),
        ..
      }
    )
  }

  /// Message to show an end user, if any.
  ///
  /// Permanent failures carry an actionable message. Transient and
  /// rate-limited failures collapse into one generic retryable message.
  /// Aborted operations are silent.
  pub fn user_message(&self) -> Option<String> {
    match self {
      Self::PermanentFailure { message, .. } => Some(message.clone()),
      Self::TransientFailure { .. } | Self::RateLimited { .. } => {
        Some("Something went wrong while contacting the server. Please try again.".to_string())
      }
      Self::Aborted => None,
    }
  }
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
  match retry_after {
    Some(d) => format!(" (retry after {} ms)", d.as_millis()),
    None => String::new(),
  }
}

fn code_suffix(code: &Option<u16>) -> String {
  match code {
    Some(c) => format!(" ({c})"),
    None => String::new(),
  }
}

/// Local durable storage failure.
///
/// Never fatal: the offline queue logs it and keeps working in memory.
#[derive(Debug, Error)]
pub enum PersistenceError {
  #[error("storage unavailable: {0}")]
  Unavailable(String),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to (de)serialize queue: {0}")]
  Serde(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classification() {
    assert_eq!(FetchError::transient("boom").class(), ErrorClass::Transient);
    assert_eq!(
      FetchError::rate_limited(None).class(),
      ErrorClass::RateLimited
    );
    assert_eq!(
      FetchError::permanent(Some(422), "bad").class(),
      ErrorClass::Permanent
    );
    assert!(FetchError::transient("x").is_retryable());
    assert!(!FetchError::permanent(Some(400), "x").is_retryable());
    assert!(!FetchError::Aborted.is_retryable());
  }

  #[test]
  fn test_missing_target() {
    assert!(FetchError::permanent(Some(404), "gone").is_missing_target());
    assert!(FetchError::permanent(Some(410), "gone").is_missing_target());
    assert!(!FetchError::permanent(Some(422), "bad").is_missing_target());
    assert!(!FetchError::transient("x").is_missing_target());
  }

  #[test]
  fn test_user_messages() {
    assert_eq!(
      FetchError::permanent(Some(422), "Email is required").user_message(),
      Some("Email is required".to_string())
    );
    let transient = FetchError::transient("connection reset").user_message();
    let limited = FetchError::rate_limited(Some(Duration::from_secs(1))).user_message();
    assert!(transient.is_some());
    assert_eq!(transient, limited);
    assert_eq!(FetchError::Aborted.user_message(), None);
  }

  #[test]
  fn test_display() {
    assert_eq!(
      FetchError::rate_limited(Some(Duration::from_millis(1500))).to_string(),
      "rate limited (retry after 1500 ms)"
    );
    assert_eq!(
      FetchError::permanent(Some(400), "nope").to_string(),
      "request rejected (400): nope"
    );
    assert_eq!(FetchError::Aborted.to_string(), "request aborted");
  }
}
