use std::time::Duration;

use tokio::time::Instant;

use crate::config::CacheConfig;

/// Lifetimes applied to one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPolicy {
  /// After this the entry may be refreshed
  pub stale_after: Duration,
  /// After this the entry is dropped
  pub expire_after: Duration,
}

impl Default for EntryPolicy {
  fn default() -> Self {
    Self::from_config(&CacheConfig::default())
  }
}

impl EntryPolicy {
  pub fn from_config(config: &CacheConfig) -> Self {
    Self {
      stale_after: config.stale_after(),
      expire_after: config.expire_after(),
    }
  }
}

/// How usable an entry is right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  Fresh,
  Stale,
  /// Invalidated after it was fetched. Never served.
  Invalidated,
  /// Past its hard lifetime. Never served.
  Expired,
}

/// Last successful result for one key.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  pub key: String,
  pub value: V,
  pub fetched_at: Instant,
  pub policy: EntryPolicy,
  /// Invalidation generation the value was fetched under
  pub generation: u64,
}

impl<V> CacheEntry<V> {
  pub fn freshness(&self, now: Instant, current_generation: u64) -> Freshness {
    let age = now.saturating_duration_since(self.fetched_at);
    if age >= self.policy.expire_after {
      Freshness::Expired
    } else if self.generation < current_generation {
      Freshness::Invalidated
    } else if age >= self.policy.stale_after {
      Freshness::Stale
    } else {
      Freshness::Fresh
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(fetched_at: Instant, generation: u64) -> CacheEntry<u32> {
    CacheEntry {
      key: "clients:list".to_string(),
      value: 1,
      fetched_at,
      policy: EntryPolicy {
        stale_after: Duration::from_secs(10),
        expire_after: Duration::from_secs(60),
      },
      generation,
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_freshness_over_time() {
    let start = Instant::now();
    let e = entry(start, 0);
    assert_eq!(e.freshness(start, 0), Freshness::Fresh);
    assert_eq!(
      e.freshness(start + Duration::from_secs(10), 0),
      Freshness::Stale
    );
    assert_eq!(
      e.freshness(start + Duration::from_secs(60), 0),
      Freshness::Expired
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_newer_generation_invalidates() {
    let start = Instant::now();
    let e = entry(start, 2);
    assert_eq!(e.freshness(start, 3), Freshness::Invalidated);
    assert_eq!(e.freshness(start, 2), Freshness::Fresh);
  }
}
