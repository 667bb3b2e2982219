//! Single entry point for outbound reads.
//!
//! For every call the manager decides, in order:
//! 1. serve a fresh cache entry,
//! 2. attach to the fetch already running for the key,
//! 3. reject because the client-side limiter is full,
//! 4. dispatch a new fetch with retries.
//!
//! Fetches run on their own task, so a caller that gives up does not stop
//! the fetch from completing and populating the cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::entry::EntryPolicy;
use crate::cache::store::{CacheStore, Lookup};
use crate::cache::CacheResult;
use crate::config::Config;
use crate::error::{ErrorClass, FetchError};

use super::limiter::RateLimiter;
use super::policy::{RetryDecision, RetryPolicy};
use super::stats::{Counter, RequestStatCounters, RequestStats};

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
  pub stale_after: Option<Duration>,
  pub expire_after: Option<Duration>,
  pub max_retries: Option<u32>,
  /// Fires when the caller stops waiting
  pub cancel: Option<CancellationToken>,
  /// Return a stale entry immediately and refresh it in the background
  pub serve_stale: bool,
}

impl ExecuteOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_stale_after(mut self, duration: Duration) -> Self {
    self.stale_after = Some(duration);
    self
  }

  pub fn with_expire_after(mut self, duration: Duration) -> Self {
    self.expire_after = Some(duration);
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }

  pub fn with_cancel(mut self, token: CancellationToken) -> Self {
    self.cancel = Some(token);
    self
  }

  pub fn serve_stale(mut self) -> Self {
    self.serve_stale = true;
    self
  }
}

/// Construction parameters for [`RequestManager`].
pub struct ManagerSettings {
  pub retry: RetryPolicy,
  pub entries: EntryPolicy,
  pub stats_window: Duration,
  pub limiter: Option<RateLimiter>,
}

impl Default for ManagerSettings {
  fn default() -> Self {
    Self {
      retry: RetryPolicy::default(),
      entries: EntryPolicy::default(),
      stats_window: Duration::from_secs(60),
      limiter: None,
    }
  }
}

impl ManagerSettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      retry: RetryPolicy::from_config(&config.retry),
      entries: EntryPolicy::from_config(&config.cache),
      stats_window: Duration::from_secs(config.stats.window_secs),
      limiter: config.rate_limit.as_ref().map(RateLimiter::from_config),
    }
  }
}

struct InFlight<V> {
  id: u64,
  generation: u64,
  result: SharedFetch<V>,
}

struct State<V> {
  cache: CacheStore<V>,
  in_flight: HashMap<String, InFlight<V>>,
  next_id: u64,
}

struct Inner<V> {
  state: Mutex<State<V>>,
  stats: RequestStats,
  limiter: Option<RateLimiter>,
  retry: RetryPolicy,
  entries: EntryPolicy,
}

impl<V: Clone + Send + Sync + 'static> Inner<V> {
  fn lock(&self) -> MutexGuard<'_, State<V>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Release the in-flight marker and store the result if still current.
  fn finish(
    &self,
    key: &str,
    id: u64,
    generation: u64,
    result: &Result<V, FetchError>,
    policy: EntryPolicy,
  ) {
    let mut state = self.lock();
    let released = state.in_flight.get(key).is_some_and(|f| f.id == id);
    if released {
      state.in_flight.remove(key);
    }

    match result {
      Ok(value) => {
        self.stats.record(Counter::Succeeded);
        if !state
          .cache
          .store(key, value.clone(), generation, policy, Instant::now())
        {
          debug!(key, "discarding result fetched before invalidation");
        }
      }
      Err(e) => {
        self.stats.record(Counter::Failed);
        debug!(key, error = %e, "fetch failed");
      }
    }
    if released {
      state.cache.release(key);
    }
  }
}

/// Deduplicating, retrying, rate-limited request executor.
///
/// Cheap to clone; clones share cache, in-flight table and stats.
pub struct RequestManager<V> {
  inner: Arc<Inner<V>>,
}

impl<V> Clone for RequestManager<V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<V: Clone + Send + Sync + 'static> RequestManager<V> {
  pub fn new(settings: ManagerSettings) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State {
          cache: CacheStore::new(),
          in_flight: HashMap::new(),
          next_id: 0,
        }),
        stats: RequestStats::new(settings.stats_window),
        limiter: settings.limiter,
        retry: settings.retry,
        entries: settings.entries,
      }),
    }
  }

  /// Run `fetcher` for `key` unless the cache or an in-flight fetch can answer.
  ///
  /// `fetcher` may be called several times when retrying.
  pub async fn execute<F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: ExecuteOptions,
  ) -> Result<CacheResult<V>, FetchError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    if key.is_empty() {
      return Err(FetchError::permanent(None, "cache key must not be empty"));
    }
    if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
      self.inner.stats.record(Counter::Aborted);
      return Err(FetchError::Aborted);
    }

    let policy = self.entry_policy(&options);
    let (pending, joined) = {
      let mut state = self.inner.lock();
      match state.cache.lookup(key, Instant::now()) {
        Lookup::Fresh(value, fetched_at) => {
          self.inner.stats.record(Counter::ServedFromCache);
          debug!(key, "served from cache");
          return Ok(CacheResult::from_cache(value, fetched_at, false));
        }
        Lookup::Stale(value, fetched_at) if options.serve_stale => {
          self.inner.stats.record(Counter::ServedFromCache);
          match self.attach_or_dispatch(&mut state, key, fetcher, &options, policy) {
            Ok(_) => debug!(key, "served stale entry, refreshing in background"),
            Err(e) => debug!(key, error = %e, "served stale entry, refresh not started"),
          }
          return Ok(CacheResult::from_cache(value, fetched_at, true));
        }
        Lookup::Stale(..) | Lookup::Miss => {}
      }
      self.attach_or_dispatch(&mut state, key, fetcher, &options, policy)?
    };
    if joined {
      self.inner.stats.record(Counter::Deduplicated);
    }

    let result = match &options.cancel {
      Some(token) => tokio::select! {
        biased;
        _ = token.cancelled() => {
          self.inner.stats.record(Counter::Aborted);
          debug!(key, "caller detached from request");
          return Err(FetchError::Aborted);
        }
        result = pending => result,
      },
      None => pending.await,
    };

    result.map(|data| {
      if joined {
        CacheResult::joined(data)
      } else {
        CacheResult::from_network(data)
      }
    })
  }

  /// Mark every key equal to `pattern` or under `pattern:` as stale.
  pub fn invalidate(&self, pattern: &str) -> usize {
    let mut state = self.inner.lock();
    let State {
      cache, in_flight, ..
    } = &mut *state;
    let count = cache.invalidate(pattern, in_flight.keys().map(String::as_str));
    debug!(pattern, count, "invalidated cache keys");
    count
  }

  /// Optimistically replace the cached value for `key`.
  pub fn write(&self, key: &str, value: V) {
    let policy = self.inner.entries;
    self
      .inner
      .lock()
      .cache
      .write(key, value, policy, Instant::now());
  }

  pub fn purge_expired(&self) -> usize {
    let mut state = self.inner.lock();
    let State {
      cache, in_flight, ..
    } = &mut *state;
    cache.purge_expired(Instant::now(), in_flight.keys().map(String::as_str))
  }

  /// Drop every cached value and the current stats window.
  ///
  /// Fetches already running finish, but their results are discarded.
  pub fn reset(&self) {
    {
      let mut state = self.inner.lock();
      let State {
        cache, in_flight, ..
      } = &mut *state;
      cache.clear(in_flight.keys().map(String::as_str));
    }
    self.inner.stats.reset();
  }

  pub fn stats(&self) -> RequestStatCounters {
    self.inner.stats.snapshot()
  }

  pub fn in_flight(&self) -> usize {
    self.inner.lock().in_flight.len()
  }

  pub fn cached(&self) -> usize {
    self.inner.lock().cache.len()
  }

  fn entry_policy(&self, options: &ExecuteOptions) -> EntryPolicy {
    let defaults = self.inner.entries;
    let stale_after = options.stale_after.unwrap_or(defaults.stale_after);
    EntryPolicy {
      stale_after,
      expire_after: options
        .expire_after
        .unwrap_or(defaults.expire_after)
        .max(stale_after),
    }
  }

  /// Join the current-generation fetch for `key` or start a new one.
  ///
  /// Returns the shared result and whether the caller joined.
  fn attach_or_dispatch<F, Fut>(
    &self,
    state: &mut State<V>,
    key: &str,
    fetcher: F,
    options: &ExecuteOptions,
    policy: EntryPolicy,
  ) -> Result<(SharedFetch<V>, bool), FetchError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let generation = state.cache.generation(key);
    let superseded = match state.in_flight.get(key) {
      Some(running) if running.generation == generation => {
        debug!(key, "joined in-flight request");
        return Ok((running.result.clone(), true));
      }
      Some(running) => Some(running.result.clone()),
      None => None,
    };

    if let Some(limiter) = &self.inner.limiter {
      if let Err(wait) = limiter.try_acquire() {
        self.inner.stats.record(Counter::RateLimited);
        warn!(key, wait_ms = wait.as_millis() as u64, "client-side rate limit reached");
        return Err(FetchError::rate_limited(Some(wait)));
      }
    }

    let retry = match options.max_retries {
      Some(n) => self.inner.retry.clone().with_max_retries(n),
      None => self.inner.retry.clone(),
    };

    let id = state.next_id;
    state.next_id += 1;

    let inner = Arc::clone(&self.inner);
    let task_key = key.to_string();
    let handle = tokio::spawn(async move {
      // Never overlap with a fetch for the same key, even a superseded one.
      if let Some(previous) = superseded {
        let _ = previous.await;
      }
      let result = run_with_retries(&task_key, &fetcher, &retry, &inner.stats).await;
      inner.finish(&task_key, id, generation, &result, policy);
      result
    });

    let result = handle
      .map(|joined| {
        joined.unwrap_or_else(|e| Err(FetchError::transient(format!("fetch task failed: {e}"))))
      })
      .boxed()
      .shared();

    state.in_flight.insert(
      key.to_string(),
      InFlight {
        id,
        generation,
        result: result.clone(),
      },
    );
    self.inner.stats.record(Counter::Issued);
    debug!(key, generation, "dispatched request");

    Ok((result, false))
  }
}

async fn run_with_retries<V, F, Fut>(
  key: &str,
  fetcher: &F,
  policy: &RetryPolicy,
  stats: &RequestStats,
) -> Result<V, FetchError>
where
  F: Fn() -> Fut,
  Fut: Future<Output = Result<V, FetchError>>,
{
  let mut attempt = 0;
  let mut rate_limit_waited = Duration::ZERO;
  let mut rate_limited = false;

  loop {
    let error = match fetcher().await {
      Ok(value) => return Ok(value),
      Err(e) => e,
    };

    let is_rate_limit = error.class() == ErrorClass::RateLimited;
    if is_rate_limit && !rate_limited {
      rate_limited = true;
      stats.record(Counter::RateLimited);
    }

    match policy.decide(&error, attempt, rate_limit_waited) {
      RetryDecision::RetryAfter(delay) => {
        if is_rate_limit {
          rate_limit_waited += delay;
        }
        stats.record(Counter::Retried);
        warn!(
          key,
          attempt = attempt + 1,
          delay_ms = delay.as_millis() as u64,
          error = %error,
          "request failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      RetryDecision::GiveUp => return Err(error),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
  use tokio::time::sleep;

  type TestFetcher = Box<dyn Fn() -> BoxFuture<'static, Result<i32, FetchError>> + Send + Sync>;

  fn manager() -> RequestManager<i32> {
    RequestManager::new(ManagerSettings::default())
  }

  /// Fetcher that counts calls, takes `delay` and returns `value`.
  fn counting(calls: &Arc<AtomicUsize>, delay: Duration, value: i32) -> TestFetcher {
    let calls = Arc::clone(calls);
    Box::new(move || {
      let calls = Arc::clone(&calls);
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        sleep(delay).await;
        Ok(value)
      }
      .boxed()
    })
  }

  /// Fetcher that replays `script` one result per call, then repeats the last.
  fn scripted(calls: &Arc<AtomicUsize>, script: Vec<Result<i32, FetchError>>) -> TestFetcher {
    let calls = Arc::clone(calls);
    let script = Arc::new(script);
    Box::new(move || {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      let result = script[n.min(script.len() - 1)].clone();
      async move { result }.boxed()
    })
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_calls_share_one_fetch() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));

    let callers = (0..5u64).map(|i| {
      let manager = manager.clone();
      let fetcher = counting(&calls, Duration::from_millis(200), 42);
      async move {
        sleep(Duration::from_millis(i * 10)).await;
        manager
          .execute("clients:list", fetcher, ExecuteOptions::new())
          .await
      }
    });
    let results = futures::future::join_all(callers).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in &results {
      assert_eq!(result.as_ref().map(|r| r.data), Ok(42));
    }
    assert_eq!(results[0].as_ref().unwrap().source, crate::cache::CacheSource::Network);
    assert_eq!(results[4].as_ref().unwrap().source, crate::cache::CacheSource::Joined);

    let stats = manager.stats();
    assert_eq!(stats.issued, 1);
    assert_eq!(stats.deduplicated, 4);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(manager.in_flight(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_joined_callers_share_failure() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let failing = {
      let calls = Arc::clone(&calls);
      move || {
        let calls = Arc::clone(&calls);
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          sleep(Duration::from_millis(100)).await;
          Err::<i32, _>(FetchError::permanent(Some(403), "forbidden"))
        }
      }
    };

    let (a, b, c) = tokio::join!(
      manager.execute("payments:list", failing.clone(), ExecuteOptions::new()),
      manager.execute("payments:list", failing.clone(), ExecuteOptions::new()),
      manager.execute("payments:list", failing, ExecuteOptions::new()),
    );

    let expected = FetchError::permanent(Some(403), "forbidden");
    assert_eq!(a.unwrap_err(), expected);
    assert_eq!(b.unwrap_err(), expected);
    assert_eq!(c.unwrap_err(), expected);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().failed, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_entry_served_from_cache() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = manager
      .execute("inventory_items:list", counting(&calls, Duration::ZERO, 5), ExecuteOptions::new())
      .await
      .unwrap();
    let second = manager
      .execute("inventory_items:list", counting(&calls, Duration::ZERO, 6), ExecuteOptions::new())
      .await
      .unwrap();

    assert_eq!(first.data, 5);
    assert_eq!(second.data, 5);
    assert_eq!(second.source, crate::cache::CacheSource::CacheFresh);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().served_from_cache, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_is_refetched() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ExecuteOptions::new().with_stale_after(Duration::from_secs(10));

    manager
      .execute("clients:list", counting(&calls, Duration::ZERO, 1), options.clone())
      .await
      .unwrap();
    sleep(Duration::from_secs(11)).await;
    let refreshed = manager
      .execute("clients:list", counting(&calls, Duration::ZERO, 2), options)
      .await
      .unwrap();

    assert_eq!(refreshed.data, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_serve_stale_refreshes_in_background() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ExecuteOptions::new()
      .with_stale_after(Duration::from_secs(10))
      .serve_stale();

    manager
      .execute("clients:list", counting(&calls, Duration::ZERO, 1), options.clone())
      .await
      .unwrap();
    sleep(Duration::from_secs(11)).await;

    let stale = manager
      .execute("clients:list", counting(&calls, Duration::from_millis(100), 2), options.clone())
      .await
      .unwrap();
    assert_eq!(stale.data, 1);
    assert_eq!(stale.source, crate::cache::CacheSource::CacheStale);

    sleep(Duration::from_millis(200)).await;
    let fresh = manager
      .execute("clients:list", counting(&calls, Duration::ZERO, 3), options)
      .await
      .unwrap();
    assert_eq!(fresh.data, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_hit_joining_refresh_counts_once() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ExecuteOptions::new()
      .with_stale_after(Duration::from_secs(10))
      .serve_stale();

    manager
      .execute("clients:list", counting(&calls, Duration::ZERO, 1), options.clone())
      .await
      .unwrap();
    sleep(Duration::from_secs(11)).await;

    let (a, b) = tokio::join!(
      manager.execute(
        "clients:list",
        counting(&calls, Duration::from_millis(100), 2),
        options.clone()
      ),
      manager.execute(
        "clients:list",
        counting(&calls, Duration::from_millis(100), 2),
        options
      ),
    );
    assert_eq!(a.unwrap().data, 1);
    assert_eq!(b.unwrap().data, 1);

    let stats = manager.stats();
    assert_eq!(stats.served_from_cache, 2);
    assert_eq!(stats.deduplicated, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failures_are_retried() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = scripted(
      &calls,
      vec![
        Err(FetchError::transient("reset")),
        Err(FetchError::transient("reset")),
        Ok(9),
      ],
    );

    let started = Instant::now();
    let result = manager
      .execute("appointments:list", fetcher, ExecuteOptions::new())
      .await
      .unwrap();

    assert_eq!(result.data, 9);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 250ms + 500ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(750));
    assert_eq!(manager.stats().retried, 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_exhaust_into_transient_failure() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = scripted(&calls, vec![Err(FetchError::transient("down"))]);

    let err = manager
      .execute("appointments:list", fetcher, ExecuteOptions::new())
      .await
      .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Transient);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_permanent_failure_is_not_retried() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = scripted(&calls, vec![Err(FetchError::permanent(Some(422), "bad"))]);

    let err = manager
      .execute("clients:list", fetcher, ExecuteOptions::new())
      .await
      .unwrap_err();

    assert_eq!(err, FetchError::permanent(Some(422), "bad"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().retried, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rate_limit_waits_for_retry_after() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = scripted(
      &calls,
      vec![Err(FetchError::rate_limited(Some(Duration::from_secs(2)))), Ok(1)],
    );

    let started = Instant::now();
    let result = manager
      .execute("clients:list", fetcher, ExecuteOptions::new())
      .await
      .unwrap();

    assert_eq!(result.data, 1);
    assert!(started.elapsed() >= Duration::from_secs(2));
    let stats = manager.stats();
    assert_eq!(stats.rate_limited, 1);
    assert_eq!(stats.retried, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rate_limit_beyond_budget_surfaces() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = scripted(
      &calls,
      vec![Err(FetchError::rate_limited(Some(Duration::from_secs(30))))],
    );

    let err = manager
      .execute("clients:list", fetcher, ExecuteOptions::new())
      .await
      .unwrap_err();

    assert_eq!(err.class(), ErrorClass::RateLimited);
    // First wait is clamped to 10s, the second would exceed the budget.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_aborted_caller_still_populates_cache() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let token = CancellationToken::new();

    let canceller = {
      let token = token.clone();
      tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        token.cancel();
      })
    };

    let err = manager
      .execute(
        "clients:list",
        counting(&calls, Duration::from_millis(200), 7),
        ExecuteOptions::new().with_cancel(token),
      )
      .await
      .unwrap_err();
    canceller.await.unwrap();
    assert_eq!(err, FetchError::Aborted);
    assert_eq!(manager.stats().aborted, 1);

    sleep(Duration::from_millis(300)).await;
    let cached = manager
      .execute("clients:list", counting(&calls, Duration::ZERO, 8), ExecuteOptions::new())
      .await
      .unwrap();
    assert_eq!(cached.data, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_detaching_one_caller_leaves_others() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let token = CancellationToken::new();
    token.cancel();

    let (aborted, kept) = tokio::join!(
      manager.execute(
        "clients:list",
        counting(&calls, Duration::from_millis(100), 3),
        ExecuteOptions::new().with_cancel(token),
      ),
      manager.execute(
        "clients:list",
        counting(&calls, Duration::from_millis(100), 3),
        ExecuteOptions::new(),
      ),
    );

    assert_eq!(aborted.unwrap_err(), FetchError::Aborted);
    assert_eq!(kept.unwrap().data, 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_during_fetch_forces_new_fetch() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let version = Arc::new(AtomicI32::new(1));

    let fetcher = {
      let (calls, active, max_active, version) = (
        Arc::clone(&calls),
        Arc::clone(&active),
        Arc::clone(&max_active),
        Arc::clone(&version),
      );
      move || {
        let (calls, active, max_active, version) = (
          Arc::clone(&calls),
          Arc::clone(&active),
          Arc::clone(&max_active),
          Arc::clone(&version),
        );
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
          max_active.fetch_max(now_active, Ordering::SeqCst);
          // Snapshot the backend state when the request is sent.
          let seen = version.load(Ordering::SeqCst);
          sleep(Duration::from_millis(200)).await;
          active.fetch_sub(1, Ordering::SeqCst);
          Ok::<_, FetchError>(seen)
        }
      }
    };

    let first = {
      let manager = manager.clone();
      let fetcher = fetcher.clone();
      tokio::spawn(async move {
        manager
          .execute("clients:list", fetcher, ExecuteOptions::new())
          .await
      })
    };

    sleep(Duration::from_millis(50)).await;
    version.store(2, Ordering::SeqCst);
    assert_eq!(manager.invalidate("clients"), 1);

    let second = manager
      .execute("clients:list", fetcher.clone(), ExecuteOptions::new())
      .await
      .unwrap();
    assert_eq!(second.data, 2);
    assert_eq!(first.await.unwrap().unwrap().data, 1);

    let third = manager
      .execute("clients:list", fetcher, ExecuteOptions::new())
      .await
      .unwrap();
    assert_eq!(third.data, 2);
    assert_eq!(third.source, crate::cache::CacheSource::CacheFresh);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_is_visible_to_next_read() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    manager.write("clients:detail:1", 11);

    let read = manager
      .execute("clients:detail:1", counting(&calls, Duration::ZERO, 0), ExecuteOptions::new())
      .await
      .unwrap();
    assert_eq!(read.data, 11);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_client_side_limiter_rejects() {
    let manager = RequestManager::new(ManagerSettings {
      limiter: Some(RateLimiter::new(1, Duration::from_secs(60))),
      ..ManagerSettings::default()
    });
    let calls = Arc::new(AtomicUsize::new(0));

    manager
      .execute("a:1", counting(&calls, Duration::ZERO, 1), ExecuteOptions::new())
      .await
      .unwrap();
    let err = manager
      .execute("a:2", counting(&calls, Duration::ZERO, 2), ExecuteOptions::new())
      .await
      .unwrap_err();

    assert_eq!(err.class(), ErrorClass::RateLimited);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().rate_limited, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidated_keys_do_not_accumulate() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    for i in 0..50 {
      let key = format!("clients:detail:{i}");
      manager
        .execute(&key, counting(&calls, Duration::ZERO, i), ExecuteOptions::new())
        .await
        .unwrap();
    }
    manager.invalidate("clients");
    assert_eq!(manager.purge_expired(), 50);
    assert_eq!(manager.inner.lock().cache.tracked(), 0);

    // Invalidated while in flight: the result is discarded and nothing lingers.
    let running = manager.clone();
    let fetcher = counting(&calls, Duration::from_millis(50), 1);
    let fetch = tokio::spawn(async move {
      running
        .execute("clients:list", fetcher, ExecuteOptions::new())
        .await
    });
    tokio::task::yield_now().await;
    manager.invalidate("clients");
    assert_eq!(fetch.await.unwrap().unwrap().data, 1);
    assert_eq!(manager.cached(), 0);
    assert_eq!(manager.in_flight(), 0);
    assert_eq!(manager.inner.lock().cache.tracked(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_drops_cache() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    manager
      .execute("a:1", counting(&calls, Duration::ZERO, 1), ExecuteOptions::new())
      .await
      .unwrap();
    assert_eq!(manager.cached(), 1);

    manager.reset();
    assert_eq!(manager.cached(), 0);
    assert_eq!(manager.stats(), RequestStatCounters::default());
  }

  #[tokio::test]
  async fn test_empty_key_is_rejected() {
    let manager = manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let err = manager
      .execute("", counting(&calls, Duration::ZERO, 1), ExecuteOptions::new())
      .await
      .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Permanent);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }
}
