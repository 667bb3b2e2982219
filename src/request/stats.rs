//! Windowed request statistics. Observability only.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Counts for the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStatCounters {
  /// Fresh dispatches (one per logical request)
  pub issued: u64,
  pub served_from_cache: u64,
  /// Callers attached to an in-flight request
  pub deduplicated: u64,
  pub rate_limited: u64,
  pub retried: u64,
  pub aborted: u64,
  pub succeeded: u64,
  pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
  Issued,
  ServedFromCache,
  Deduplicated,
  RateLimited,
  Retried,
  Aborted,
  Succeeded,
  Failed,
}

impl RequestStatCounters {
  fn bump(&mut self, counter: Counter) {
    let slot = match counter {
      Counter::Issued => &mut self.issued,
      Counter::ServedFromCache => &mut self.served_from_cache,
      Counter::Deduplicated => &mut self.deduplicated,
      Counter::RateLimited => &mut self.rate_limited,
      Counter::Retried => &mut self.retried,
      Counter::Aborted => &mut self.aborted,
      Counter::Succeeded => &mut self.succeeded,
      Counter::Failed => &mut self.failed,
    };
    *slot += 1;
  }
}

impl fmt::Display for RequestStatCounters {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "issued={} cache={} dedup={} rate_limited={} retried={} aborted={} ok={} failed={}",
      self.issued,
      self.served_from_cache,
      self.deduplicated,
      self.rate_limited,
      self.retried,
      self.aborted,
      self.succeeded,
      self.failed
    )
  }
}

struct Window {
  started: Instant,
  counters: RequestStatCounters,
}

/// Counters that reset every `window`.
pub struct RequestStats {
  window: Duration,
  inner: Mutex<Window>,
}

impl RequestStats {
  pub fn new(window: Duration) -> Self {
    Self {
      window,
      inner: Mutex::new(Window {
        started: Instant::now(),
        counters: RequestStatCounters::default(),
      }),
    }
  }

  pub fn record(&self, counter: Counter) {
    let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    self.roll(&mut inner);
    inner.counters.bump(counter);
  }

  /// Counters for the current window.
  pub fn snapshot(&self) -> RequestStatCounters {
    let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    self.roll(&mut inner);
    inner.counters
  }

  pub fn reset(&self) {
    let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner.started = Instant::now();
    inner.counters = RequestStatCounters::default();
  }

  fn roll(&self, window: &mut Window) {
    if window.started.elapsed() < self.window {
      return;
    }
    debug!(stats = %window.counters, "request stats window closed");
    window.started = Instant::now();
    window.counters = RequestStatCounters::default();
  }
}
