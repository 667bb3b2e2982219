//! In-memory cache map with per-key invalidation generations.

use std::collections::{HashMap, HashSet};

use tokio::time::Instant;
use tracing::debug;

use super::entry::{CacheEntry, EntryPolicy, Freshness};

/// Outcome of looking a key up.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
  Fresh(V, Instant),
  Stale(V, Instant),
  Miss,
}

/// Cached values plus a generation counter per key.
///
/// A fetch records the generation of its key when it starts. Its result is
/// stored only if the generation has not moved in the meantime, so data
/// fetched before an invalidation can never be written back after it.
/// A generation is kept only while its key has an entry or a running fetch.
pub struct CacheStore<V> {
  entries: HashMap<String, CacheEntry<V>>,
  generations: HashMap<String, u64>,
}

impl<V> Default for CacheStore<V> {
  fn default() -> Self {
    Self {
      entries: HashMap::new(),
      generations: HashMap::new(),
    }
  }
}

/// Whether `key` falls under `pattern` (the key itself, or `pattern:` prefix).
pub fn key_matches(key: &str, pattern: &str) -> bool {
  if pattern.is_empty() {
    return false;
  }
  if key == pattern {
    return true;
  }
  if pattern.ends_with(':') {
    return key.starts_with(pattern);
  }
  key
    .strip_prefix(pattern)
    .is_some_and(|rest| rest.starts_with(':'))
}

impl<V: Clone> CacheStore<V> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn generation(&self, key: &str) -> u64 {
    self.generations.get(key).copied().unwrap_or(0)
  }

  /// Look up a servable value. Expired entries are evicted on the way.
  pub fn lookup(&mut self, key: &str, now: Instant) -> Lookup<V> {
    let current = self.generation(key);
    let Some(entry) = self.entries.get(key) else {
      return Lookup::Miss;
    };

    match entry.freshness(now, current) {
      Freshness::Fresh => Lookup::Fresh(entry.value.clone(), entry.fetched_at),
      Freshness::Stale => Lookup::Stale(entry.value.clone(), entry.fetched_at),
      Freshness::Invalidated => {
        self.entries.remove(key);
        Lookup::Miss
      }
      Freshness::Expired => {
        debug!(key, "evicting expired cache entry");
        self.entries.remove(key);
        Lookup::Miss
      }
    }
  }

  /// Store a fetch result if `generation` is still current.
  ///
  /// Returns false when the result was discarded.
  pub fn store(
    &mut self,
    key: &str,
    value: V,
    generation: u64,
    policy: EntryPolicy,
    now: Instant,
  ) -> bool {
    if generation != self.generation(key) {
      return false;
    }
    self.entries.insert(
      key.to_string(),
      CacheEntry {
        key: key.to_string(),
        value,
        fetched_at: now,
        policy,
        generation,
      },
    );
    true
  }

  /// Optimistic local write. Supersedes any fetch already running for `key`.
  pub fn write(&mut self, key: &str, value: V, policy: EntryPolicy, now: Instant) {
    let generation = self.bump(key);
    self.store(key, value, generation, policy, now);
  }

  /// Invalidate every key matching `pattern`, including `extra` keys that
  /// have no entry yet (e.g. keys with a fetch in flight).
  ///
  /// Returns the number of keys whose generation moved.
  pub fn invalidate<'a>(&mut self, pattern: &str, extra: impl IntoIterator<Item = &'a str>) -> usize {
    let mut keys: Vec<String> = self
      .entries
      .keys()
      .filter(|k| key_matches(k, pattern))
      .cloned()
      .collect();
    for key in extra {
      if key_matches(key, pattern) && !keys.iter().any(|k| k == key) {
        keys.push(key.to_string());
      }
    }

    for key in &keys {
      self.bump(key);
    }
    keys.len()
  }

  /// Drop entries past their hard lifetime or superseded by an
  /// invalidation, then forget generations no one can observe.
  ///
  /// `in_flight` lists keys with a running fetch. Returns the number of
  /// entries dropped.
  pub fn purge_expired<'a>(
    &mut self,
    now: Instant,
    in_flight: impl IntoIterator<Item = &'a str>,
  ) -> usize {
    let before = self.entries.len();
    let generations = &self.generations;
    self.entries.retain(|key, e| {
      let current = generations.get(key.as_str()).copied().unwrap_or(0);
      e.generation == current
        && now.saturating_duration_since(e.fetched_at) < e.policy.expire_after
    });

    let running: HashSet<&str> = in_flight.into_iter().collect();
    let entries = &self.entries;
    self
      .generations
      .retain(|key, _| entries.contains_key(key) || running.contains(key.as_str()));
    before - self.entries.len()
  }

  /// Forget the generation of `key` once its fetch is done and it has no
  /// entry.
  pub fn release(&mut self, key: &str) {
    if !self.entries.contains_key(key) {
      self.generations.remove(key);
    }
  }

  /// Number of keys holding a generation.
  pub fn tracked(&self) -> usize {
    self.generations.len()
  }

  /// Drop all entries and supersede every fetch still running.
  ///
  /// `in_flight` lists keys with a running fetch that may have no entry yet.
  pub fn clear<'a>(&mut self, in_flight: impl IntoIterator<Item = &'a str>) {
    let mut keys: Vec<String> = self.entries.keys().cloned().collect();
    keys.extend(in_flight.into_iter().map(String::from));
    self.entries.clear();

    for generation in self.generations.values_mut() {
      *generation += 1;
    }
    for key in keys {
      // Keys seen for the first time still need to move past generation 0.
      self.generations.entry(key).or_insert(1);
    }
  }

  fn bump(&mut self, key: &str) -> u64 {
    let generation = self.generations.entry(key.to_string()).or_insert(0);
    *generation += 1;
    *generation
  }
}
