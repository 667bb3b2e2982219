//! Shared query cache keyed by logical query identity.

use std::future::Future;

use tracing::debug;

use crate::error::FetchError;
use crate::remote::types::Resource;
use crate::request::{ExecuteOptions, RequestManager};

use super::traits::{CacheResult, QueryKey};

/// Reads go through the request manager; writes and invalidations act on
/// the same store, so every view of a key sees the same value.
pub struct QueryCache<V> {
  manager: RequestManager<V>,
}

impl<V> Clone for QueryCache<V> {
  fn clone(&self) -> Self {
    Self {
      manager: self.manager.clone(),
    }
  }
}

impl<V: Clone + Send + Sync + 'static> QueryCache<V> {
  pub fn new(manager: RequestManager<V>) -> Self {
    Self { manager }
  }

  pub fn manager(&self) -> &RequestManager<V> {
    &self.manager
  }

  pub async fn read<K, F, Fut>(
    &self,
    query: &K,
    fetcher: F,
    options: ExecuteOptions,
  ) -> Result<CacheResult<V>, FetchError>
  where
    K: QueryKey + ?Sized,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let key = query.cache_key();
    debug!(key = %key, query = %query.description(), "cache read");
    self.manager.execute(&key, fetcher, options).await
  }

  /// Invalidate a key or every key under `prefix:`.
  pub fn invalidate(&self, prefix: &str) -> usize {
    self.manager.invalidate(prefix)
  }

  /// Invalidate a table and every table whose reads embed it.
  pub fn invalidate_resource(&self, resource: Resource) -> usize {
    let mut count = self.invalidate(resource.table());
    for dependent in resource.dependents() {
      count += self.invalidate(dependent.table());
    }
    count
  }

  /// Optimistic local update.
  pub fn write<K: QueryKey + ?Sized>(&self, query: &K, value: V) {
    self.manager.write(&query.cache_key(), value);
  }
}
