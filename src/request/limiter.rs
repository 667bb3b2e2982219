//! Client-side sliding-window request limiter.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Allows at most `max_requests` dispatches in any `window`.
pub struct RateLimiter {
  max_requests: usize,
  window: Duration,
  dispatched: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
  pub fn new(max_requests: u32, window: Duration) -> Self {
    Self {
      max_requests: max_requests.max(1) as usize,
      window,
      dispatched: Mutex::new(VecDeque::new()),
    }
  }

  pub fn from_config(config: &RateLimitConfig) -> Self {
    Self::new(config.max_requests, Duration::from_secs(config.window_secs))
  }

  /// Take a slot, or return how long until one frees up.
  pub fn try_acquire(&self) -> Result<(), Duration> {
    let now = Instant::now();
    let mut dispatched = self
      .dispatched
      .lock()
      .unwrap_or_else(PoisonError::into_inner);

    while dispatched
      .front()
      .is_some_and(|t| now.duration_since(*t) >= self.window)
    {
      dispatched.pop_front();
    }

    if dispatched.len() < self.max_requests {
      dispatched.push_back(now);
      return Ok(());
    }

    // Oldest entry leaves the window first.
    let oldest = dispatched.front().copied().unwrap_or(now);
    Err(self.window.saturating_sub(now.duration_since(oldest)))
  }
}
