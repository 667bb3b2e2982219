//! Boundary classification of remote responses.
//!
//! Raw HTTP status codes and error bodies are turned into a [`RemoteOutcome`]
//! exactly once, where the response is received. Nothing downstream looks at
//! status codes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::FetchError;

/// Tagged result of a remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome<T> {
  Ok(T),
  ClientError { code: u16, message: String },
  ServerError { status: u16, message: String },
  RateLimited { retry_after: Option<Duration> },
}

impl RemoteOutcome<Value> {
  /// Classify an HTTP response.
  ///
  /// `retry_after` is the raw `Retry-After` header, if any.
  pub fn from_response(status: u16, retry_after: Option<&str>, body: Value) -> Self {
    match status {
      200..=299 => Self::Ok(body),
      429 => Self::RateLimited {
        retry_after: retry_after.and_then(parse_retry_after),
      },
      400..=499 => Self::ClientError {
        code: status,
        message: error_message(&body).unwrap_or_else(|| format!("request rejected with {status}")),
      },
      _ => Self::ServerError {
        status,
        message: error_message(&body).unwrap_or_else(|| format!("server responded with {status}")),
      },
    }
  }
}

impl<T> RemoteOutcome<T> {
  pub fn is_rate_limited(&self) -> bool {
    matches!(self, Self::RateLimited { .. })
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RemoteOutcome<U> {
    match self {
      Self::Ok(v) => RemoteOutcome::Ok(f(v)),
      Self::ClientError { code, message } => RemoteOutcome::ClientError { code, message },
      Self::ServerError { status, message } => RemoteOutcome::ServerError { status, message },
      Self::RateLimited { retry_after } => RemoteOutcome::RateLimited { retry_after },
    }
  }

  pub fn into_result(self) -> Result<T, FetchError> {
    match self {
      Self::Ok(v) => Ok(v),
      Self::ClientError { code, message } => Err(FetchError::permanent(Some(code), message)),
      Self::ServerError { status, message } => {
        Err(FetchError::transient(format!("{status}: {message}")))
      }
      Self::RateLimited { retry_after } => Err(FetchError::rate_limited(retry_after)),
    }
  }
}

/// Larger values are treated as garbage.
const MAX_RETRY_AFTER_SECS: f64 = 86_400.0;

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
  let value = value.trim();
  if let Ok(secs) = value.parse::<f64>() {
    if secs.is_finite() && (0.0..=MAX_RETRY_AFTER_SECS).contains(&secs) {
      return Some(Duration::from_secs_f64(secs));
    }
    return None;
  }

  DateTime::parse_from_rfc2822(value).ok().map(|at| {
    (at.with_timezone(&Utc) - Utc::now())
      .to_std()
      .unwrap_or(Duration::ZERO)
  })
}

/// Pull a human-readable message out of a structured error body.
fn error_message(body: &Value) -> Option<String> {
  match body {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Object(map) => ["message", "error_description", "error", "msg", "details"]
      .iter()
      .filter_map(|field| map.get(*field))
      .find_map(|v| v.as_str().filter(|s| !s.is_empty()).map(String::from)),
    _ => None,
  }
}
